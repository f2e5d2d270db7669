//! Opaque handle encoding
//!
//! A handle is a bit-packed `(slab, chunk, tag)` triple identifying one
//! chunk of pool memory independently of its machine address. The packing
//! is described by a [HandleRepr] implementation rather than native
//! bit-fields, so the layout is portable and a compile-time knob.
//!
//! Field order within the raw integer is `slab | chunk | tag`, high bits
//! to low. Identity and ordering are defined on `(slab, chunk)` only; the
//! tag is client-owned and never inspected by the pool.

use std::{
    cmp,
    fmt::{self, Debug},
    hash::{Hash, Hasher},
};

/// Raw integer type a handle packs into
///
/// Workaround for the lack of a common std trait over `u32`/`u64`;
/// holds the conversions the packing math needs.
pub trait RawBits: Copy + Eq + Ord + Hash + Debug + Default + Send + Sync + 'static {
    /// Width of the raw integer in bits
    const WIDTH: u32;

    fn from_bits(bits: u64) -> Self;
    fn to_bits(self) -> u64;
}

impl RawBits for u32 {
    const WIDTH: u32 = 32;

    #[inline]
    fn from_bits(bits: u64) -> Self {
        bits as u32
    }

    #[inline]
    fn to_bits(self) -> u64 {
        self as u64
    }
}

impl RawBits for u64 {
    const WIDTH: u32 = 64;

    #[inline]
    fn from_bits(bits: u64) -> Self {
        bits
    }

    #[inline]
    fn to_bits(self) -> u64 {
        self
    }
}

/// Descriptor of a handle layout: raw width and field widths
///
/// The three field widths must sum to `Raw::WIDTH`. `slab` occupies the
/// high bits, `tag` the low bits.
pub trait HandleRepr: 'static {
    /// Backing integer; also sets the chunk alignment granule of the pool
    type Raw: RawBits;

    /// Bits for the block index. Block tables hold `2^SLAB_BITS` entries.
    const SLAB_BITS: u32;
    /// Bits for the position within a block
    const CHUNK_BITS: u32;
    /// Bits reserved for the client; opaque to the pool
    const TAG_BITS: u32;
}

/// Default layout: 32-bit handles, 16-bit slab, 15-bit chunk, 1-bit tag
pub struct CompactRepr;
impl HandleRepr for CompactRepr {
    type Raw = u32;
    const SLAB_BITS: u32 = 16;
    const CHUNK_BITS: u32 = 15;
    const TAG_BITS: u32 = 1;
}

/// Larger universe: 64-bit handles, 16-bit slab, 16-bit chunk, 32-bit tag
pub struct WideRepr;
impl HandleRepr for WideRepr {
    type Raw = u64;
    const SLAB_BITS: u32 = 16;
    const CHUNK_BITS: u32 = 16;
    const TAG_BITS: u32 = 32;
}

const _: () =
    assert!(CompactRepr::SLAB_BITS + CompactRepr::CHUNK_BITS + CompactRepr::TAG_BITS == 32);
const _: () = assert!(WideRepr::SLAB_BITS + WideRepr::CHUNK_BITS + WideRepr::TAG_BITS == 64);

#[inline]
const fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Compact identity for one pool chunk
///
/// Trivially copyable; stable for the lifetime of the chunk it names.
/// `slab == 0` is the null handle. Reinterpretable as a plain bitvector
/// via [raw](Handle::raw)/[from_raw](Handle::from_raw) for hashing or
/// serialisation by clients.
pub struct Handle<R: HandleRepr = CompactRepr> {
    raw: R::Raw,
}

impl<R: HandleRepr> Handle<R> {
    /// The null handle (slab 0, all fields zero)
    #[inline]
    pub fn null() -> Self {
        Self {
            raw: R::Raw::default(),
        }
    }

    /// Pack a `(slab, chunk)` pair; tag starts at zero
    #[inline]
    pub(crate) fn new(slab: u32, chunk: u32) -> Self {
        debug_assert!((slab as u64) <= mask(R::SLAB_BITS));
        debug_assert!((chunk as u64) <= mask(R::CHUNK_BITS));
        let bits = ((slab as u64) << (R::CHUNK_BITS + R::TAG_BITS)) | ((chunk as u64) << R::TAG_BITS);
        Self {
            raw: R::Raw::from_bits(bits),
        }
    }

    /// Reconstruct a handle from its raw bitvector form
    #[inline]
    pub fn from_raw(raw: R::Raw) -> Self {
        Self { raw }
    }

    /// The raw bitvector form (includes the tag)
    #[inline]
    pub fn raw(self) -> R::Raw {
        self.raw
    }

    #[inline]
    pub fn slab(self) -> u32 {
        ((self.raw.to_bits() >> (R::CHUNK_BITS + R::TAG_BITS)) & mask(R::SLAB_BITS)) as u32
    }

    #[inline]
    pub fn chunk(self) -> u32 {
        ((self.raw.to_bits() >> R::TAG_BITS) & mask(R::CHUNK_BITS)) as u32
    }

    #[inline]
    pub fn tag(self) -> u64 {
        self.raw.to_bits() & mask(R::TAG_BITS)
    }

    #[inline]
    pub fn with_slab(self, slab: u32) -> Self {
        debug_assert!((slab as u64) <= mask(R::SLAB_BITS));
        let shift = R::CHUNK_BITS + R::TAG_BITS;
        let bits = (self.raw.to_bits() & !(mask(R::SLAB_BITS) << shift)) | ((slab as u64) << shift);
        Self {
            raw: R::Raw::from_bits(bits),
        }
    }

    #[inline]
    pub fn with_chunk(self, chunk: u32) -> Self {
        debug_assert!((chunk as u64) <= mask(R::CHUNK_BITS));
        let bits = (self.raw.to_bits() & !(mask(R::CHUNK_BITS) << R::TAG_BITS))
            | ((chunk as u64) << R::TAG_BITS);
        Self {
            raw: R::Raw::from_bits(bits),
        }
    }

    #[inline]
    pub fn with_tag(self, tag: u64) -> Self {
        debug_assert!(tag <= mask(R::TAG_BITS));
        let bits = (self.raw.to_bits() & !mask(R::TAG_BITS)) | (tag & mask(R::TAG_BITS));
        Self {
            raw: R::Raw::from_bits(bits),
        }
    }

    /// Strip the tag; used before a handle enters a freelist chain
    #[inline]
    pub(crate) fn without_tag(self) -> Self {
        Self {
            raw: R::Raw::from_bits(self.raw.to_bits() & !mask(R::TAG_BITS)),
        }
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.slab() == 0
    }

    /// The `(slab, chunk)` pair as one integer; what identity and order
    /// are defined on
    #[inline]
    fn ident_bits(self) -> u64 {
        self.raw.to_bits() >> R::TAG_BITS
    }
}

impl<R: HandleRepr> Clone for Handle<R> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}
impl<R: HandleRepr> Copy for Handle<R> {}

impl<R: HandleRepr> Default for Handle<R> {
    fn default() -> Self {
        Self::null()
    }
}

impl<R: HandleRepr> PartialEq for Handle<R> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.ident_bits() == other.ident_bits()
    }
}
impl<R: HandleRepr> Eq for Handle<R> {}

impl<R: HandleRepr> PartialOrd for Handle<R> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<R: HandleRepr> Ord for Handle<R> {
    /// Lexicographic on `(slab, chunk)`; the tag is ignored
    #[inline]
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.ident_bits().cmp(&other.ident_bits())
    }
}

impl<R: HandleRepr> Hash for Handle<R> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.ident_bits());
    }
}

impl<R: HandleRepr> Debug for Handle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Handle(null)")
        } else {
            write!(f, "Handle({}:{}#{})", self.slab(), self.chunk(), self.tag())
        }
    }
}
