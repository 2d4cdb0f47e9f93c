use crate::config::MutatorSettings;
use crate::input::{CameraField, CameraInput, Input};
use rand::Rng;
use rand::seq::IndexedRandom;

const POSITION_DELTAS: [f32; 6] = [-100.0, -10.0, -1.0, 1.0, 10.0, 100.0];
const ZOOM_DELTAS: [f32; 6] = [-5.0, -1.0, -0.1, 0.1, 1.0, 5.0];
const BLOCK_SIZES: [usize; 4] = [4, 8, 16, 32];
const MAX_EXTEND: usize = 100;
const SPLICE_MIN: usize = 4;
const SPLICE_MAX: usize = 32;

/// Boundary floats substituted by `InterestingValues`.
pub const INTERESTING_FLOATS: [f32; 7] = [
    0.0,
    -0.0,
    1.0,
    -1.0,
    f32::INFINITY,
    f32::NEG_INFINITY,
    f32::NAN,
];

/// Camera keywords plus canonical 4-byte encodings of 0, -1, 1.0f and -1.0f.
pub const DICTIONARY_TOKENS: [&[u8]; 10] = [
    b"CAMERA",
    b"POSITION",
    b"ROTATION",
    b"ZOOM",
    b"MATRIX",
    b"QUATERNION",
    b"\x00\x00\x00\x00",
    b"\xff\xff\xff\xff",
    b"\x00\x00\x80\x3f",
    b"\x00\x00\x80\xbf",
];

/// A `Mutator` derives a new input from an existing one. The seed is never modified.
pub trait Mutator<I: Input> {
    fn mutate<R: Rng + ?Sized>(&self, input: &I, rng: &mut R) -> I;
}

/// The closed set of mutation strategies.
///
/// Byte-oriented strategies work on the raw payload and are no-ops when it is
/// absent. Field-oriented strategies (`Arithmetic`, `InterestingValues`) work on
/// the structured fields and skip the ones that are missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationStrategy {
    BitFlip,
    ByteFlip,
    Arithmetic,
    InterestingValues,
    BlockShuffle,
    TruncateExtend,
    Splice,
    Dictionary,
}

impl MutationStrategy {
    pub const ALL: [MutationStrategy; 8] = [
        MutationStrategy::BitFlip,
        MutationStrategy::ByteFlip,
        MutationStrategy::Arithmetic,
        MutationStrategy::InterestingValues,
        MutationStrategy::BlockShuffle,
        MutationStrategy::TruncateExtend,
        MutationStrategy::Splice,
        MutationStrategy::Dictionary,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MutationStrategy::BitFlip => "bit_flip",
            MutationStrategy::ByteFlip => "byte_flip",
            MutationStrategy::Arithmetic => "arithmetic",
            MutationStrategy::InterestingValues => "interesting_values",
            MutationStrategy::BlockShuffle => "block_shuffle",
            MutationStrategy::TruncateExtend => "truncate_extend",
            MutationStrategy::Splice => "splice",
            MutationStrategy::Dictionary => "dictionary",
        }
    }

    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::ALL[rng.random_range(0..Self::ALL.len())]
    }

    /// Applies this strategy to `input`, returning a fresh value.
    pub fn apply<R: Rng + ?Sized>(
        &self,
        input: &CameraInput,
        rng: &mut R,
        settings: &MutatorSettings,
    ) -> CameraInput {
        match self {
            MutationStrategy::BitFlip => mutate_payload(input, |bytes| bit_flip(bytes, rng)),
            MutationStrategy::ByteFlip => mutate_payload(input, |bytes| byte_flip(bytes, rng)),
            MutationStrategy::Arithmetic => arithmetic(input, rng),
            MutationStrategy::InterestingValues => {
                interesting_values(input, rng, settings.interesting_value_probability)
            }
            MutationStrategy::BlockShuffle => {
                mutate_payload(input, |bytes| block_shuffle(bytes, rng))
            }
            MutationStrategy::TruncateExtend => {
                mutate_payload(input, |bytes| truncate_extend(bytes, rng))
            }
            MutationStrategy::Splice => mutate_payload(input, |bytes| splice(bytes, rng)),
            MutationStrategy::Dictionary => mutate_payload(input, |bytes| dictionary(bytes, rng)),
        }
    }
}

/// Replaces one component of `field` with a boundary value, unconditionally.
/// No-op when `field` is absent.
pub fn replace_with_interesting<R: Rng + ?Sized>(
    input: &CameraInput,
    field: CameraField,
    rng: &mut R,
) -> CameraInput {
    let mut out = input.clone();
    if !out.has_field(field) {
        return out;
    }
    let index = match field {
        CameraField::Position => rng.random_range(0..3),
        CameraField::Rotation => rng.random_range(0..4),
        CameraField::Zoom => 0,
    };
    let value = INTERESTING_FLOATS[rng.random_range(0..INTERESTING_FLOATS.len())];
    out.set_component(field, index, value);
    out
}

// Byte strategies edit a copy of the payload; the result is re-decoded so the
// structured view always agrees with the bytes that will be written.
fn mutate_payload<F>(input: &CameraInput, edit: F) -> CameraInput
where
    F: FnOnce(&mut Vec<u8>),
{
    match &input.bytes {
        Some(bytes) => {
            let mut bytes = bytes.clone();
            edit(&mut bytes);
            CameraInput::decode(&bytes)
        }
        None => input.clone(),
    }
}

fn bit_flip<R: Rng + ?Sized>(bytes: &mut [u8], rng: &mut R) {
    if bytes.is_empty() {
        return;
    }
    for _ in 0..rng.random_range(1..=8) {
        let idx = rng.random_range(0..bytes.len());
        bytes[idx] ^= 1u8 << rng.random_range(0..8u32);
    }
}

fn byte_flip<R: Rng + ?Sized>(bytes: &mut [u8], rng: &mut R) {
    if bytes.is_empty() {
        return;
    }
    for _ in 0..rng.random_range(1..=4) {
        let idx = rng.random_range(0..bytes.len());
        bytes[idx] ^= 0xFF;
    }
}

fn arithmetic<R: Rng + ?Sized>(input: &CameraInput, rng: &mut R) -> CameraInput {
    let mut out = input.clone();
    let candidates: Vec<CameraField> = [CameraField::Position, CameraField::Zoom]
        .into_iter()
        .filter(|field| out.has_field(*field))
        .collect();
    match candidates.choose(rng) {
        Some(CameraField::Position) => {
            if let Some(position) = out.position {
                let idx = rng.random_range(0..3);
                let delta = POSITION_DELTAS[rng.random_range(0..POSITION_DELTAS.len())];
                out.set_component(CameraField::Position, idx, position[idx] + delta);
            }
        }
        Some(CameraField::Zoom) => {
            if let Some(zoom) = out.zoom {
                let delta = ZOOM_DELTAS[rng.random_range(0..ZOOM_DELTAS.len())];
                out.set_component(CameraField::Zoom, 0, zoom + delta);
            }
        }
        _ => {}
    }
    out
}

fn interesting_values<R: Rng + ?Sized>(
    input: &CameraInput,
    rng: &mut R,
    probability: f64,
) -> CameraInput {
    let mut out = input.clone();
    for field in [CameraField::Position, CameraField::Rotation, CameraField::Zoom] {
        if out.has_field(field) && rng.random_bool(probability) {
            out = replace_with_interesting(&out, field, rng);
        }
    }
    out
}

fn block_shuffle<R: Rng + ?Sized>(bytes: &mut [u8], rng: &mut R) {
    let block = BLOCK_SIZES[rng.random_range(0..BLOCK_SIZES.len())];
    if bytes.len() < block * 2 {
        return;
    }
    let first = rng.random_range(0..=bytes.len() - 2 * block);
    let second = rng.random_range(first + block..=bytes.len() - block);
    let (head, tail) = bytes.split_at_mut(second);
    head[first..first + block].swap_with_slice(&mut tail[..block]);
}

fn truncate_extend<R: Rng + ?Sized>(bytes: &mut Vec<u8>, rng: &mut R) {
    if rng.random_bool(0.5) {
        if bytes.len() > 4 {
            let new_len = rng.random_range(1..bytes.len());
            bytes.truncate(new_len);
        }
    } else {
        let extend_by = rng.random_range(1..=MAX_EXTEND);
        if rng.random_bool(0.5) {
            bytes.resize(bytes.len() + extend_by, 0);
        } else {
            bytes.extend((0..extend_by).map(|_| rng.random::<u8>()));
        }
    }
}

fn splice<R: Rng + ?Sized>(bytes: &mut Vec<u8>, rng: &mut R) {
    if bytes.len() <= 8 {
        return;
    }
    let start = rng.random_range(0..=bytes.len() - SPLICE_MIN);
    let len = rng.random_range(SPLICE_MIN..=SPLICE_MAX.min(bytes.len() - start));
    let window = bytes[start..start + len].to_vec();
    let at = rng.random_range(0..=bytes.len());
    bytes.splice(at..at, window);
}

fn dictionary<R: Rng + ?Sized>(bytes: &mut [u8], rng: &mut R) {
    let token = DICTIONARY_TOKENS[rng.random_range(0..DICTIONARY_TOKENS.len())];
    if bytes.len() < token.len() {
        return;
    }
    let at = rng.random_range(0..=bytes.len() - token.len());
    bytes[at..at + token.len()].copy_from_slice(token);
}

/// Picks one strategy uniformly, and occasionally stacks 2-5 more on top.
#[derive(Debug, Clone, Default)]
pub struct CameraMutator {
    settings: MutatorSettings,
}

impl CameraMutator {
    pub fn new(settings: MutatorSettings) -> Self {
        Self { settings }
    }

    /// Like [`Mutator::mutate`], also returning the strategies applied in order.
    pub fn mutate_traced<R: Rng + ?Sized>(
        &self,
        input: &CameraInput,
        rng: &mut R,
    ) -> (CameraInput, Vec<MutationStrategy>) {
        let first = MutationStrategy::random(rng);
        let mut applied = vec![first];
        let mut mutated = first.apply(input, rng, &self.settings);

        if rng.random_bool(self.settings.stack_probability) {
            for _ in 0..rng.random_range(2..=5) {
                let strategy = MutationStrategy::random(rng);
                mutated = strategy.apply(&mutated, rng, &self.settings);
                applied.push(strategy);
            }
        }
        (mutated, applied)
    }
}

impl Mutator<CameraInput> for CameraMutator {
    fn mutate<R: Rng + ?Sized>(&self, input: &CameraInput, rng: &mut R) -> CameraInput {
        self.mutate_traced(input, rng).0
    }
}
