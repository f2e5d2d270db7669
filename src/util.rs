use std::{cmp, fmt, fmt::Write};

/// Round `num` up to the next multiple of `to`
///
/// `to` must be nonzero. `align(0, to) == 0`.
pub const fn align(num: usize, to: usize) -> usize {
    ((num + to - 1) / to) * to
}

/// Divide, rounding up
pub const fn divroundup(num: usize, divisor: usize) -> usize {
    (num + divisor - 1) / divisor
}

/// Render one chunk payload for eye inspection
///
/// `ident` is the chunk's human-readable identifier (see
/// [identifier](crate::access::identifier)); `word` is the handle width,
/// so the first group of a free chunk reads as its freelist link.
pub unsafe fn _debug_dump_chunk(
    ident: &str,
    p: *const u8,
    sz: usize,
    word: usize,
) -> Result<String, fmt::Error> {
    let mut s = String::new();
    writeln!(&mut s, "{} ({} bytes)", ident, sz)?;

    let row_bytes = word * 4;
    let mut off = 0;
    while off < sz {
        let row = cmp::min(sz - off, row_bytes);
        write!(&mut s, "  +{:04X}: ", off)?;
        for i in 0..row {
            if i > 0 && i % word == 0 {
                write!(&mut s, " ")?;
            }
            write!(&mut s, "{:02X}", *p.add(off + i))?;
        }
        write!(&mut s, "\n")?;
        off += row;
    }

    Ok(s)
}
