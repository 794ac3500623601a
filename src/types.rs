use std::fmt;

use dlog_codec::{self as codec, Decode, Encode, Input, ItemKind, Output};
use rand::Rng;

/// Ordered severity rank of a log record.
///
/// The named ranks leave numeric gaps so callers can define intermediate
/// levels; any value up to [`Severity::FATAL`] round-trips through the wire
/// format. [`Severity::DISABLE`] sits above every rank and marks a sink or
/// context that accepts nothing.
///
/// On the wire a severity is a single positive integer with an offset of
/// one, so that [`Severity::NONE`] is never emitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Severity(u8);

impl Severity {
    pub const NONE: Self = Self(0);
    pub const TRACE: Self = Self(1);
    pub const DEBUG: Self = Self(5);
    pub const INFO: Self = Self(9);
    pub const WARN: Self = Self(13);
    pub const ERROR: Self = Self(17);
    pub const FATAL: Self = Self(21);
    /// Threshold value that disables a sink or context entirely.
    pub const DISABLE: Self = Self(25);

    /// Largest value the wire format can carry.
    pub(crate) const ENCODED_MAX: u8 = 23;
    const ENCODING_OFFSET: u8 = 1;

    /// Builds a severity from its numeric rank.
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Severity::NONE => "none",
            Severity::TRACE => "trace",
            Severity::DEBUG => "debug",
            Severity::INFO => "info",
            Severity::WARN => "warn",
            Severity::ERROR => "error",
            Severity::FATAL => "fatal",
            Severity::DISABLE => "disable",
            Severity(raw) => return write!(f, "severity({raw})"),
        };
        f.write_str(name)
    }
}

impl Encode for Severity {
    fn encoded_size(&self) -> u64 {
        1
    }

    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> codec::Result<()> {
        let bits = self.0.wrapping_sub(Self::ENCODING_OFFSET);
        if bits > Self::ENCODED_MAX {
            return Err(codec::Error::ItemValueOutOfRange);
        }
        out.write_all(&[bits])
    }
}

impl Decode for Severity {
    fn decode<I: Input + ?Sized>(input: &mut I) -> codec::Result<Self> {
        let bits = codec::parse_u64_max(input, u64::from(Self::ENCODED_MAX))?;
        Ok(Self(bits as u8 + Self::ENCODING_OFFSET))
    }
}

/// Threshold applied to contexts that have not chosen their own.
pub const DEFAULT_THRESHOLD: Severity = Severity::WARN;

/// Flag bit separating user-defined ids from the well-known ones.
pub const USER_DEFINED_ID_FLAG: u64 = 1 << 7;

/// Opaque identifier of an attribute kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(pub u64);

impl ResourceId {
    /// Source file path of the call site.
    pub const FILE: Self = Self(2);
    /// Source line of the call site.
    pub const LINE: Self = Self(3);
    /// Enclosing function of the call site.
    pub const FUNCTION: Self = Self(4);

    /// Builds a user-defined attribute id.
    pub const fn user_defined(id: u64) -> Self {
        Self(id | USER_DEFINED_ID_FLAG)
    }
}

impl Encode for ResourceId {
    fn encoded_size(&self) -> u64 {
        self.0.encoded_size()
    }

    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> codec::Result<()> {
        self.0.encode(out)
    }
}

impl Decode for ResourceId {
    fn decode<I: Input + ?Sized>(input: &mut I) -> codec::Result<Self> {
        Ok(Self(codec::parse_u64(input)?))
    }
}

/// Numeric tag identifying the concrete type of a reified record argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReificationTypeId(pub u64);

impl ReificationTypeId {
    pub const UINT64: Self = Self(0);
    pub const INT64: Self = Self(1);
    pub const STRING: Self = Self(2);
    pub const SPAN_CONTEXT: Self = Self(3);
    pub const STATUS_CODE: Self = Self(4);

    /// Builds a user-defined reification type id.
    pub const fn user_defined(id: u64) -> Self {
        Self(id | USER_DEFINED_ID_FLAG)
    }
}

impl Encode for ReificationTypeId {
    fn encoded_size(&self) -> u64 {
        self.0.encoded_size()
    }

    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> codec::Result<()> {
        self.0.encode(out)
    }
}

impl Decode for ReificationTypeId {
    fn decode<I: Input + ?Sized>(input: &mut I) -> codec::Result<Self> {
        Ok(Self(codec::parse_u64(input)?))
    }
}

/// 128-bit trace identifier; all-zero is the invalid sentinel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TraceId([u8; 16]);

impl TraceId {
    pub const STATE_SIZE: usize = 16;

    pub const fn invalid() -> Self {
        Self([0; 16])
    }

    /// Draws a fresh random trace id.
    ///
    /// The all-zero value is re-drawn so it stays reserved as the invalid
    /// sentinel.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let bits: [u8; 16] = rng.gen();
            if bits != [0; 16] {
                return Self(bits);
            }
        }
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::invalid()
    }

    /// The id as two native-endian 64-bit words, low half first.
    pub(crate) fn to_words(self) -> (u64, u64) {
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&self.0[..8]);
        hi.copy_from_slice(&self.0[8..]);
        (u64::from_ne_bytes(lo), u64::from_ne_bytes(hi))
    }

    /// Folds the id down to 32 bits for region selection.
    pub(crate) fn spread(self) -> u32 {
        let (p0, p1) = self.to_words();
        let folded = p0 ^ p1;
        (folded ^ (folded >> 32)) as u32
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Encode for TraceId {
    fn encoded_size(&self) -> u64 {
        1 + Self::STATE_SIZE as u64
    }

    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> codec::Result<()> {
        codec::emit_binary(out, &self.0)
    }
}

impl Decode for TraceId {
    fn decode<I: Input + ?Sized>(input: &mut I) -> codec::Result<Self> {
        let mut bytes = [0u8; 16];
        codec::parse_binary_exact(input, &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// 64-bit span identifier; all-zero is the invalid sentinel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SpanId([u8; 8]);

impl SpanId {
    pub const STATE_SIZE: usize = 8;

    pub const fn invalid() -> Self {
        Self([0; 8])
    }

    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub(crate) fn from_word(word: u64) -> Self {
        Self(word.to_ne_bytes())
    }

    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::invalid()
    }

    /// Low 32 bits, used to pin a producer inside a span to one region.
    pub(crate) fn spread(self) -> u32 {
        u64::from_ne_bytes(self.0) as u32
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Encode for SpanId {
    fn encoded_size(&self) -> u64 {
        1 + Self::STATE_SIZE as u64
    }

    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> codec::Result<()> {
        codec::emit_binary(out, &self.0)
    }
}

impl Decode for SpanId {
    fn decode<I: Input + ?Sized>(input: &mut I) -> codec::Result<Self> {
        let mut bytes = [0u8; 8];
        codec::parse_binary_exact(input, &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// Pair of trace and span identifiers describing a record's owner.
///
/// Encodes as the null item while invalid and as a two-element array
/// otherwise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SpanContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

impl SpanContext {
    pub const fn invalid() -> Self {
        Self {
            trace_id: TraceId::invalid(),
            span_id: SpanId::invalid(),
        }
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::invalid()
    }
}

impl Encode for SpanContext {
    fn encoded_size(&self) -> u64 {
        if self.is_valid() {
            1 + self.trace_id.encoded_size() + self.span_id.encoded_size()
        } else {
            1
        }
    }

    fn encode<O: Output + ?Sized>(&self, out: &mut O) -> codec::Result<()> {
        if !self.is_valid() {
            return codec::emit_null(out);
        }
        codec::emit_array(out, 2)?;
        self.trace_id.encode(out)?;
        self.span_id.encode(out)
    }
}

impl Decode for SpanContext {
    fn decode<I: Input + ?Sized>(input: &mut I) -> codec::Result<Self> {
        if codec::try_parse_null(input)? {
            return Ok(Self::invalid());
        }
        codec::expect_item_head(input, ItemKind::Array, 2)?;
        Ok(Self {
            trace_id: TraceId::decode(input)?,
            span_id: SpanId::decode(input)?,
        })
    }
}

const PRIME64_1: u64 = 0x9e37_79b1_85eb_ca87;
const PRIME64_2: u64 = 0xc2b2_ae3d_27d4_eb4f;
const PRIME64_3: u64 = 0x1656_67b1_9e37_79f9;
const PRIME64_4: u64 = 0x85eb_ca77_c2b2_ae63;
const PRIME64_5: u64 = 0x27d4_eb2f_1656_67c5;

#[inline]
fn mix_lane(lane: u64) -> u64 {
    // One xxHash64 round over a zero accumulator, with a plain shift in
    // place of the rotate. The shift is part of the on-disk contract: span
    // ids derived by other writers of this format must match bit for bit.
    lane.wrapping_mul(PRIME64_2)
        .wrapping_shl(31)
        .wrapping_mul(PRIME64_1)
}

/// Derives a span id from the owning trace and a per-region counter.
///
/// An xxHash-64 derivative specialized for a 24-byte input: three 8-byte
/// lanes, a single mixing round per lane, and the standard final
/// avalanche. Distinct `(trace, counter)` inputs give practically
/// collision-free span ids without any cross-producer coordination.
pub(crate) fn derive_span_id(trace_p0: u64, trace_p1: u64, ctr: u64) -> SpanId {
    let mut acc = PRIME64_5.wrapping_add(3 * 8);

    for lane in [trace_p0, trace_p1, ctr] {
        acc ^= mix_lane(lane);
        acc = acc.wrapping_shl(27).wrapping_mul(PRIME64_1);
        acc = acc.wrapping_add(PRIME64_4);
    }

    acc ^= acc >> 33;
    acc = acc.wrapping_mul(PRIME64_2);
    acc ^= acc >> 29;
    acc = acc.wrapping_mul(PRIME64_3);
    acc ^= acc >> 32;

    SpanId::from_word(acc)
}

/// Maps a 32-bit hash onto `buckets` without a modulo.
pub(crate) fn hash_to_index(hash: u32, buckets: u32) -> u32 {
    ((u64::from(hash) * u64::from(buckets)) >> 32) as u32
}

/// Cheap avalanche of the current thread id, used to scatter producers
/// that log outside of any span across regions.
pub(crate) fn hashed_thread_id() -> u32 {
    use std::hash::{Hash, Hasher};

    struct Fold(u64);

    impl Hasher for Fold {
        fn finish(&self) -> u64 {
            self.0
        }

        fn write(&mut self, bytes: &[u8]) {
            for &byte in bytes {
                self.0 = (self.0 ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3);
            }
        }
    }

    let mut hasher = Fold(0xcbf2_9ce4_8422_2325);
    std::thread::current().id().hash(&mut hasher);
    let mut x = hasher.finish();
    x ^= x >> 27;
    x = x.wrapping_mul(0x3c79_ac49_2ba7_b653);
    x ^= x >> 33;
    x = x.wrapping_mul(0x1c69_b3f7_4ac4_ae35);
    x ^= x >> 27;
    x as u32
}
