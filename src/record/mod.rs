//! Touch record layouts.
//!
//! A touch file is a headerless sequence of fixed-size records. Three layout
//! generations exist, each a strict superset of the previous one:
//!
//! ```text
//! V1 (10 words)  [pre_ids ×3][post_ids ×3][branch][distance_soma][pre_offset][post_offset]
//! V2 (20 words)  V1 + [pre_section_fraction][post_section_fraction]
//!                     [pre_position ×3][post_position ×3][spine_length][branch_type]
//! V3 (26 words)  V2 + [pre_position_center ×3][post_position_surface ×3]
//! ```
//!
//! Every field occupies exactly one 32-bit word. This lets the reader treat
//! a record as `[u32; N]` when converting byte order ([`swap_words`]); any
//! future field must keep that property. `branch_type` fills its word with
//! one byte followed by three bytes of padding; the padding is ignored.
//!
//! In memory all generations share one canonical [`Touch`] holding the union
//! of the fields plus the [`LayoutVersion`] it was decoded from. Widening
//! ([`Touch::widen`]) only ever fills in appended fields with their defaults.


use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Size in bytes of one record word.
pub const WORD_SIZE: usize = std::mem::size_of::<u32>();

/// Index of the neuron id within an id triplet.
pub const NEURON_ID: usize = 0;
/// Index of the section id within an id triplet.
pub const SECTION_ID: usize = 1;
/// Index of the segment id within an id triplet.
pub const SEGMENT_ID: usize = 2;

/// Default `spine_length` for records that predate V2.
pub const DEFAULT_SPINE_LENGTH: f32 = -1.0;
/// Default `branch_type` for records that predate V2.
pub const DEFAULT_BRANCH_TYPE: u8 = 255;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised while decoding a single record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    /// The word slice does not match the layout's word count.
    #[error("expected {expected} words for layout {version}, got {actual}")]
    WordCount {
        version: LayoutVersion,
        expected: usize,
        actual: usize,
    },

    /// Unknown layout name.
    #[error("unknown layout version '{0}'")]
    UnknownVersion(String),
}

// ------------------------------------------------------------------------------------------------
// Layout version
// ------------------------------------------------------------------------------------------------

/// On-disk record layout generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LayoutVersion {
    V1,
    V2,
    #[default]
    V3,
}

impl LayoutVersion {
    /// All known layouts, oldest first.
    pub const ALL: [LayoutVersion; 3] = [Self::V1, Self::V2, Self::V3];

    /// Number of 32-bit words in one record.
    pub const fn words(self) -> usize {
        match self {
            Self::V1 => 10,
            Self::V2 => 20,
            Self::V3 => 26,
        }
    }

    /// Size of one record in bytes.
    pub const fn record_size(self) -> usize {
        self.words() * WORD_SIZE
    }
}

impl std::fmt::Display for LayoutVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V1 => f.write_str("v1"),
            Self::V2 => f.write_str("v2"),
            Self::V3 => f.write_str("v3"),
        }
    }
}

impl std::str::FromStr for LayoutVersion {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "v1" | "1" => Ok(Self::V1),
            "v2" | "2" => Ok(Self::V2),
            "v3" | "3" => Ok(Self::V3),
            _ => Err(RecordError::UnknownVersion(s.to_string())),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Canonical record
// ------------------------------------------------------------------------------------------------

/// One touch, holding the union of every layout's fields.
///
/// `version` records the layout the values were decoded from (or widened
/// to). Fields introduced after that version carry their defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Touch {
    pub version: LayoutVersion,

    // V1
    pub pre_ids: [i32; 3],
    pub post_ids: [i32; 3],
    pub branch: i32,
    pub distance_soma: f32,
    pub pre_offset: f32,
    pub post_offset: f32,

    // V2
    pub pre_section_fraction: f32,
    pub post_section_fraction: f32,
    pub pre_position: [f32; 3],
    pub post_position: [f32; 3],
    pub spine_length: f32,
    pub branch_type: u8,

    // V3
    pub pre_position_center: [f32; 3],
    pub post_position_surface: [f32; 3],
}

impl Default for Touch {
    fn default() -> Self {
        Self {
            version: LayoutVersion::V1,
            pre_ids: [0; 3],
            post_ids: [0; 3],
            branch: 0,
            distance_soma: 0.0,
            pre_offset: 0.0,
            post_offset: 0.0,
            pre_section_fraction: 0.0,
            post_section_fraction: 0.0,
            pre_position: [0.0; 3],
            post_position: [0.0; 3],
            spine_length: DEFAULT_SPINE_LENGTH,
            branch_type: DEFAULT_BRANCH_TYPE,
            pre_position_center: [0.0; 3],
            post_position_surface: [0.0; 3],
        }
    }
}

impl Touch {
    /// Presynaptic neuron id.
    pub fn pre_neuron_id(&self) -> i32 {
        self.pre_ids[NEURON_ID]
    }

    /// Postsynaptic neuron id.
    pub fn post_neuron_id(&self) -> i32 {
        self.post_ids[NEURON_ID]
    }

    /// Re-tags the record with a newer layout.
    ///
    /// Appended fields already hold their defaults, so widening never
    /// changes a value. Narrowing is not supported: asking for an older
    /// layout returns the record unchanged.
    pub fn widen(self, to: LayoutVersion) -> Self {
        Self {
            version: self.version.max(to),
            ..self
        }
    }

    /// Widens to V3 and attaches a sequence index.
    pub fn indexed(self, synapse_index: u64) -> IndexedTouch {
        IndexedTouch {
            touch: self.widen(LayoutVersion::V3),
            synapse_index,
        }
    }

    /// Decodes one record from its native-order words.
    ///
    /// `words.len()` must equal `version.words()`.
    pub fn from_words(words: &[u32], version: LayoutVersion) -> Result<Self, RecordError> {
        if words.len() != version.words() {
            return Err(RecordError::WordCount {
                version,
                expected: version.words(),
                actual: words.len(),
            });
        }

        let int = |i: usize| words[i] as i32;
        let float = |i: usize| f32::from_bits(words[i]);
        let float3 = |i: usize| [float(i), float(i + 1), float(i + 2)];

        let mut touch = Touch {
            version,
            pre_ids: [int(0), int(1), int(2)],
            post_ids: [int(3), int(4), int(5)],
            branch: int(6),
            distance_soma: float(7),
            pre_offset: float(8),
            post_offset: float(9),
            ..Touch::default()
        };

        if version >= LayoutVersion::V2 {
            touch.pre_section_fraction = float(10);
            touch.post_section_fraction = float(11);
            touch.pre_position = float3(12);
            touch.post_position = float3(15);
            touch.spine_length = float(18);
            touch.branch_type = words[19].to_ne_bytes()[0];
        }

        if version >= LayoutVersion::V3 {
            touch.pre_position_center = float3(20);
            touch.post_position_surface = float3(23);
        }

        Ok(touch)
    }

    /// Appends the native-order words of this record in the given layout.
    ///
    /// Fields newer than `version` are dropped.
    pub fn to_words(&self, version: LayoutVersion, out: &mut Vec<u32>) {
        out.extend(self.pre_ids.iter().map(|v| *v as u32));
        out.extend(self.post_ids.iter().map(|v| *v as u32));
        out.push(self.branch as u32);
        out.push(self.distance_soma.to_bits());
        out.push(self.pre_offset.to_bits());
        out.push(self.post_offset.to_bits());

        if version >= LayoutVersion::V2 {
            out.push(self.pre_section_fraction.to_bits());
            out.push(self.post_section_fraction.to_bits());
            out.extend(self.pre_position.iter().map(|v| v.to_bits()));
            out.extend(self.post_position.iter().map(|v| v.to_bits()));
            out.push(self.spine_length.to_bits());
            out.push(u32::from_ne_bytes([self.branch_type, 0, 0, 0]));
        }

        if version >= LayoutVersion::V3 {
            out.extend(self.pre_position_center.iter().map(|v| v.to_bits()));
            out.extend(self.post_position_surface.iter().map(|v| v.to_bits()));
        }
    }

    /// Encodes this record as native-order bytes in the given layout.
    pub fn to_bytes(&self, version: LayoutVersion) -> Vec<u8> {
        let mut words = Vec::with_capacity(version.words());
        self.to_words(version, &mut words);
        words.iter().flat_map(|w| w.to_ne_bytes()).collect()
    }
}

/// A V3 touch plus its process-global sequence index.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IndexedTouch {
    pub touch: Touch,
    pub synapse_index: u64,
}

impl std::ops::Deref for IndexedTouch {
    type Target = Touch;

    fn deref(&self) -> &Touch {
        &self.touch
    }
}

// ------------------------------------------------------------------------------------------------
// Byte order
// ------------------------------------------------------------------------------------------------

/// Reverses the byte order of every 32-bit word in `bytes`, in place.
///
/// `bytes.len()` must be a multiple of [`WORD_SIZE`]; a trailing partial
/// word is left untouched. Applying the swap twice restores the input.
pub fn swap_words(bytes: &mut [u8]) {
    for word in bytes.chunks_exact_mut(WORD_SIZE) {
        word.reverse();
    }
}

/// Decodes records from a native-order byte buffer.
///
/// `bytes.len()` must be a multiple of `version.record_size()`.
pub(crate) fn decode_records(
    bytes: &[u8],
    version: LayoutVersion,
    out: &mut [Touch],
) -> Result<(), (usize, RecordError)> {
    let mut words = vec![0u32; version.words()];
    for (i, (raw, slot)) in bytes
        .chunks_exact(version.record_size())
        .zip(out.iter_mut())
        .enumerate()
    {
        for (w, chunk) in words.iter_mut().zip(raw.chunks_exact(WORD_SIZE)) {
            *w = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        *slot = Touch::from_words(&words, version).map_err(|e| (i, e))?;
    }
    Ok(())
}
