use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian, NoLimit},
    decode_from_slice, encode_to_vec,
    error::EncodeError,
};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;

/// Size of a fully structured camera state on the wire: 3 + 4 + 1 little-endian `f32`s.
pub const STRUCTURED_LEN: usize = 32;

const POSITION_OFFSET: usize = 0;
const ROTATION_OFFSET: usize = 12;
const ZOOM_OFFSET: usize = 28;

/// Upper bound for randomly generated position components (world extent).
const WORLD_EXTENT: f32 = 4096.0;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("Failed to encode camera field: {0}")]
    Encode(#[from] EncodeError),
}

/// Anything the fuzzer can hand to a target as a file.
pub trait Input: Clone + Send + Sync + std::fmt::Debug + 'static {
    /// Bytes written to the target's input file.
    fn to_bytes(&self) -> Result<Vec<u8>, InputError>;
    /// Builds an input from raw file contents. Must accept any byte string.
    fn from_bytes(bytes: &[u8]) -> Self;
}

impl Input for Vec<u8> {
    fn to_bytes(&self) -> Result<Vec<u8>, InputError> {
        Ok(self.clone())
    }
    fn from_bytes(bytes: &[u8]) -> Self {
        bytes.to_vec()
    }
}

/// The structured field a mutation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraField {
    Position,
    Rotation,
    Zoom,
}

#[derive(Encode, Decode, Debug, Clone, Copy, PartialEq)]
struct WireCameraState {
    position: [f32; 3],
    rotation: [f32; 4],
    zoom: f32,
}

fn wire_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// A camera-state input: optional structured fields plus an optional raw payload.
///
/// When `bytes` is present it is the authoritative encoding and is written verbatim.
/// Otherwise the present fields are written in order position, rotation, zoom.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CameraInput {
    pub position: Option<[f32; 3]>,
    pub rotation: Option<[f32; 4]>,
    pub zoom: Option<f32>,
    pub bytes: Option<Vec<u8>>,
}

impl CameraInput {
    pub fn structured(position: [f32; 3], rotation: [f32; 4], zoom: f32) -> Self {
        Self {
            position: Some(position),
            rotation: Some(rotation),
            zoom: Some(zoom),
            bytes: None,
        }
    }

    pub fn raw(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Some(bytes),
            ..Default::default()
        }
    }

    /// Parses a file's contents. Inputs of at least 32 bytes are read as a camera
    /// state and keep the full slice as payload; anything else is raw bytes only.
    /// Never fails.
    pub fn decode(data: &[u8]) -> Self {
        if data.len() >= STRUCTURED_LEN {
            if let Ok((state, _read)) =
                decode_from_slice::<WireCameraState, _>(&data[..STRUCTURED_LEN], wire_config())
            {
                return Self {
                    position: Some(state.position),
                    rotation: Some(state.rotation),
                    zoom: Some(state.zoom),
                    bytes: Some(data.to_vec()),
                };
            }
        }
        Self::raw(data.to_vec())
    }

    pub fn encode(&self) -> Result<Vec<u8>, InputError> {
        if let Some(bytes) = &self.bytes {
            return Ok(bytes.clone());
        }
        let config = wire_config();
        let mut out = Vec::with_capacity(STRUCTURED_LEN);
        if let Some(position) = &self.position {
            out.extend(encode_to_vec(position, config)?);
        }
        if let Some(rotation) = &self.rotation {
            out.extend(encode_to_vec(rotation, config)?);
        }
        if let Some(zoom) = &self.zoom {
            out.extend(encode_to_vec(zoom, config)?);
        }
        Ok(out)
    }

    pub fn has_field(&self, field: CameraField) -> bool {
        match field {
            CameraField::Position => self.position.is_some(),
            CameraField::Rotation => self.rotation.is_some(),
            CameraField::Zoom => self.zoom.is_some(),
        }
    }

    /// Sets one component of a structured field. Absent fields are left absent.
    /// A payload that carries a structured prefix is patched in place so the
    /// change reaches the target.
    pub fn set_component(&mut self, field: CameraField, index: usize, value: f32) {
        let slot_offset = match field {
            CameraField::Position => match self.position.as_mut() {
                Some(position) if index < 3 => {
                    position[index] = value;
                    POSITION_OFFSET + index * 4
                }
                _ => return,
            },
            CameraField::Rotation => match self.rotation.as_mut() {
                Some(rotation) if index < 4 => {
                    rotation[index] = value;
                    ROTATION_OFFSET + index * 4
                }
                _ => return,
            },
            CameraField::Zoom => match self.zoom.as_mut() {
                Some(zoom) if index == 0 => {
                    *zoom = value;
                    ZOOM_OFFSET
                }
                _ => return,
            },
        };
        if let Some(bytes) = self.bytes.as_mut() {
            if bytes.len() >= STRUCTURED_LEN {
                bytes[slot_offset..slot_offset + 4].copy_from_slice(&value.to_le_bytes());
            }
        }
    }

    /// A plausible camera state: position inside the world, unit quaternion, zoom in [1, 10).
    pub fn random_valid<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let position = [
            rng.random_range(0.0..WORLD_EXTENT),
            rng.random_range(0.0..WORLD_EXTENT),
            rng.random_range(0.0..WORLD_EXTENT),
        ];
        Self::structured(position, random_unit_quaternion(rng), rng.random_range(1.0..10.0))
    }

    /// Hand-picked states at the edges of the camera's operating range.
    pub fn boundary_states() -> Vec<Self> {
        vec![
            Self::structured([0.0, 0.0, 10.0], [1.0, 0.0, 0.0, 0.0], 1.0),
            Self::structured([4096.0, 4096.0, 800.0], [1.0, 0.0, 0.0, 0.0], 10.0),
            Self::structured([2048.0, 2048.0, 400.0], [0.0, 0.0, 0.0, 1.0], 5.0),
        ]
    }
}

impl Input for CameraInput {
    fn to_bytes(&self) -> Result<Vec<u8>, InputError> {
        self.encode()
    }
    fn from_bytes(bytes: &[u8]) -> Self {
        Self::decode(bytes)
    }
}

// Shoemake's subgroup algorithm, normalised as a guard against rounding.
fn random_unit_quaternion<R: Rng + ?Sized>(rng: &mut R) -> [f32; 4] {
    let u1: f32 = rng.random();
    let u2: f32 = rng.random();
    let u3: f32 = rng.random();
    let a = (1.0 - u1).sqrt();
    let b = u1.sqrt();
    let sign = |rng: &mut R| if rng.random_bool(0.5) { 1.0 } else { -1.0 };
    let w = a * sign(rng);
    let x = a * (2.0 * u2 - 1.0);
    let y = b * (2.0 * u3 - 1.0);
    let z = b * sign(rng);
    let norm = (w * w + x * x + y * y + z * z).sqrt();
    if norm > 0.0 {
        [w / norm, x / norm, y / norm, z / norm]
    } else {
        [1.0, 0.0, 0.0, 0.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() <= 1e-6, "{a:?} != {b:?}");
        }
    }

    #[test]
    fn vec_u8_impl_input() {
        let data: Vec<u8> = vec![1, 2, 3];
        assert_eq!(data.to_bytes().unwrap(), vec![1, 2, 3]);
        assert_eq!(<Vec<u8> as Input>::from_bytes(&[9]), vec![9]);
    }

    #[test]
    fn structured_input_round_trips() {
        let mut rng = ChaCha8Rng::from_seed([3u8; 32]);
        for _ in 0..20 {
            let original = CameraInput::random_valid(&mut rng);
            let encoded = original.encode().unwrap();
            assert_eq!(encoded.len(), STRUCTURED_LEN);

            let decoded = CameraInput::decode(&encoded);
            assert_close(&decoded.position.unwrap(), &original.position.unwrap());
            assert_close(&decoded.rotation.unwrap(), &original.rotation.unwrap());
            assert_close(&[decoded.zoom.unwrap()], &[original.zoom.unwrap()]);
        }
    }

    #[test]
    fn decode_accepts_any_length() {
        for len in [0usize, 1, 4, 31, 32, 33, 64, 1000] {
            let data: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let decoded = CameraInput::decode(&data);
            assert_eq!(decoded.bytes.as_deref(), Some(data.as_slice()));
            assert_eq!(decoded.zoom.is_some(), len >= STRUCTURED_LEN);
        }
    }

    #[test]
    fn decode_zero_bytes_yields_zeroed_camera() {
        let decoded = CameraInput::decode(&[0u8; 32]);
        assert_eq!(decoded.position, Some([0.0; 3]));
        assert_eq!(decoded.rotation, Some([0.0; 4]));
        assert_eq!(decoded.zoom, Some(0.0));
    }

    #[test]
    fn payload_takes_precedence_on_encode() {
        let mut input = CameraInput::structured([1.0, 2.0, 3.0], [1.0, 0.0, 0.0, 0.0], 2.0);
        input.bytes = Some(vec![0xAA; 5]);
        assert_eq!(input.encode().unwrap(), vec![0xAA; 5]);
    }

    #[test]
    fn partial_structured_input_writes_present_fields_in_order() {
        let input = CameraInput {
            position: Some([1.0, 2.0, 3.0]),
            zoom: Some(4.0),
            ..Default::default()
        };
        let encoded = input.encode().unwrap();
        assert_eq!(encoded.len(), 16);
        assert_eq!(&encoded[12..16], &4.0f32.to_le_bytes());
    }

    #[test]
    fn set_component_patches_structured_payload() {
        let mut input = CameraInput::decode(&[0u8; 40]);
        input.set_component(CameraField::Zoom, 0, 2.5);
        input.set_component(CameraField::Rotation, 3, -1.0);

        let bytes = input.bytes.clone().unwrap();
        assert_eq!(bytes.len(), 40);
        assert_eq!(&bytes[28..32], &2.5f32.to_le_bytes());
        assert_eq!(&bytes[24..28], &(-1.0f32).to_le_bytes());
        assert_eq!(CameraInput::decode(&bytes).zoom, Some(2.5));
    }

    #[test]
    fn set_component_ignores_absent_field() {
        let mut input = CameraInput::raw(vec![1, 2, 3]);
        input.set_component(CameraField::Position, 0, 7.0);
        assert_eq!(input, CameraInput::raw(vec![1, 2, 3]));
    }

    #[test]
    fn random_valid_states_are_in_range() {
        let mut rng = ChaCha8Rng::from_seed([9u8; 32]);
        for _ in 0..50 {
            let input = CameraInput::random_valid(&mut rng);
            let rotation = input.rotation.unwrap();
            let norm: f32 = rotation.iter().map(|c| c * c).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
            assert!(input.position.unwrap().iter().all(|c| (0.0..4096.0).contains(c)));
            assert!((1.0..10.0).contains(&input.zoom.unwrap()));
        }
    }
}
