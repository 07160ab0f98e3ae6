//! Adapter file codec.
//!
//! Files use the safetensors layout:
//!
//! ```text
//! [u64 LE header length N][N bytes JSON header, space padded to 8][tensor bytes]
//! ```
//!
//! Headers padded with NUL bytes instead of spaces are accepted on import.
//! The header maps each tensor name to `{dtype, shape, data_offsets}` and
//! carries string metadata under `__metadata__`. Tensor bytes follow in
//! declaration order. Matrices are stored in the same layout the kernels use:
//! `{layer}.lora_A.weight` is `[in_features, rank]` and
//! `{layer}.lora_B.weight` is `[rank, out_features]`.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use half::{bf16, f16};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AdapterError;

/// Value of the `adapter_type` metadata field.
pub const ADAPTER_TYPE: &str = "lora";
/// Format version written by this codec.
pub const FORMAT_VERSION: &str = "1.0";

const HEADER_ALIGNMENT: usize = 8;
const METADATA_KEY: &str = "__metadata__";

/// Element type of a stored tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorDtype {
    /// 32-bit float.
    F32,
    /// IEEE half precision, widened on import.
    F16,
    /// Brain float, widened on import.
    BF16,
}

impl TensorDtype {
    /// Header spelling.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::F32 => "F32",
            Self::F16 => "F16",
            Self::BF16 => "BF16",
        }
    }

    /// Bytes per element.
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
        }
    }

    fn from_safetensors(dtype: safetensors::Dtype) -> Option<Self> {
        match dtype {
            safetensors::Dtype::F32 => Some(Self::F32),
            safetensors::Dtype::F16 => Some(Self::F16),
            safetensors::Dtype::BF16 => Some(Self::BF16),
            _ => None,
        }
    }
}

/// Raw tensor payload with its dtype and shape.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorData {
    /// Element type.
    pub dtype: TensorDtype,
    /// Shape.
    pub shape: Vec<usize>,
    /// Little-endian element bytes.
    pub data: Vec<u8>,
}

impl TensorData {
    /// Encode f32 values.
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Self {
        let mut data = vec![0u8; values.len() * 4];
        LittleEndian::write_f32_into(values, &mut data);
        Self {
            dtype: TensorDtype::F32,
            shape,
            data,
        }
    }

    /// Number of elements implied by the shape.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    fn check_size(&self, name: &str) -> Result<(), AdapterError> {
        let expected = self.numel() * self.dtype.size_bytes();
        if self.data.len() != expected {
            return Err(AdapterError::TensorSize {
                name: name.to_string(),
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Decode to f32, widening half-precision types.
    pub fn to_f32(&self, name: &str) -> Result<Vec<f32>, AdapterError> {
        self.check_size(name)?;
        let numel = self.numel();
        let values = match self.dtype {
            TensorDtype::F32 => {
                let mut out = vec![0.0f32; numel];
                LittleEndian::read_f32_into(&self.data, &mut out);
                out
            }
            TensorDtype::F16 | TensorDtype::BF16 => {
                let mut bits = vec![0u16; numel];
                LittleEndian::read_u16_into(&self.data, &mut bits);
                if self.dtype == TensorDtype::F16 {
                    bits.into_iter().map(|b| f16::from_bits(b).to_f32()).collect()
                } else {
                    bits.into_iter().map(|b| bf16::from_bits(b).to_f32()).collect()
                }
            }
        };
        Ok(values)
    }
}

/// Tensors in declaration order.
pub type NamedTensors = Vec<(String, TensorData)>;

#[derive(Serialize)]
struct HeaderEntry<'a> {
    dtype: &'static str,
    shape: &'a [usize],
    data_offsets: [usize; 2],
}

/// Encode tensors and string metadata.
pub fn serialize(
    tensors: &[(String, TensorData)],
    metadata: &BTreeMap<String, String>,
) -> Result<Vec<u8>, AdapterError> {
    let mut header = serde_json::Map::new();
    if !metadata.is_empty() {
        header.insert(METADATA_KEY.to_string(), serde_json::to_value(metadata)?);
    }

    let mut offset = 0usize;
    for (name, tensor) in tensors {
        tensor.check_size(name)?;
        if name == METADATA_KEY || header.contains_key(name) {
            return Err(AdapterError::Malformed(format!(
                "duplicate or reserved tensor name '{name}'"
            )));
        }
        let end = offset + tensor.data.len();
        let entry = HeaderEntry {
            dtype: tensor.dtype.as_str(),
            shape: &tensor.shape,
            data_offsets: [offset, end],
        };
        header.insert(name.clone(), serde_json::to_value(entry)?);
        offset = end;
    }

    let mut header_bytes = serde_json::to_vec(&header)?;
    let padded_len = header_bytes.len().div_ceil(HEADER_ALIGNMENT) * HEADER_ALIGNMENT;
    header_bytes.resize(padded_len, b' ');

    let mut out = Vec::with_capacity(8 + padded_len + offset);
    out.write_u64::<LittleEndian>(padded_len as u64)?;
    out.extend_from_slice(&header_bytes);
    for (_, tensor) in tensors {
        out.extend_from_slice(&tensor.data);
    }
    debug!(
        tensors = tensors.len(),
        header_bytes = padded_len,
        total_bytes = out.len(),
        "Serialized adapter"
    );
    Ok(out)
}

/// Decode tensors (in file order) and string metadata.
pub fn deserialize(bytes: &[u8]) -> Result<(NamedTensors, BTreeMap<String, String>), AdapterError> {
    if bytes.is_empty() {
        return Err(AdapterError::Empty);
    }
    if bytes.len() < 8 {
        return Err(AdapterError::Malformed(format!(
            "{} bytes is shorter than the length prefix",
            bytes.len()
        )));
    }
    let header_len = LittleEndian::read_u64(&bytes[..8]);
    if header_len > (bytes.len() - 8) as u64 {
        return Err(AdapterError::Malformed(format!(
            "header length {} exceeds remaining {} bytes",
            header_len,
            bytes.len() - 8
        )));
    }

    let buffer = space_padded(bytes, 8 + header_len as usize);
    let bytes = buffer.as_ref();

    let (_, header) = SafeTensors::read_metadata(bytes)?;
    let metadata: BTreeMap<String, String> = header
        .metadata()
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect();

    let parsed = SafeTensors::deserialize(bytes)?;
    let base = bytes.as_ptr() as usize;
    let mut ordered = parsed
        .tensors()
        .into_iter()
        .map(|(name, view)| {
            let dtype = TensorDtype::from_safetensors(view.dtype()).ok_or_else(|| {
                AdapterError::UnsupportedDtype {
                    name: name.clone(),
                    dtype: format!("{:?}", view.dtype()),
                }
            })?;
            let offset = view.data().as_ptr() as usize - base;
            let tensor = TensorData {
                dtype,
                shape: view.shape().to_vec(),
                data: view.data().to_vec(),
            };
            Ok((offset, name, tensor))
        })
        .collect::<Result<Vec<_>, AdapterError>>()?;
    ordered.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    Ok((
        ordered.into_iter().map(|(_, name, t)| (name, t)).collect(),
        metadata,
    ))
}

/// Rewrite trailing NUL padding of the header as spaces.
fn space_padded(bytes: &[u8], header_end: usize) -> Cow<'_, [u8]> {
    let nuls = bytes[8..header_end]
        .iter()
        .rev()
        .take_while(|&&b| b == 0)
        .count();
    if nuls == 0 {
        return Cow::Borrowed(bytes);
    }
    let mut owned = bytes.to_vec();
    owned[header_end - nuls..header_end].fill(b' ');
    Cow::Owned(owned)
}

/// Provenance and hyperparameters stored with an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterMetadata {
    /// Always `lora`.
    pub adapter_type: String,
    /// File format version.
    pub format_version: String,
    /// Rank at export time.
    pub rank: usize,
    /// LoRA alpha.
    pub alpha: f32,
    /// `alpha / rank`.
    pub scaling: f32,
    /// Target module names.
    pub target_modules: Vec<String>,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// Base model identifier.
    pub model_name: String,
    /// Steps trained.
    pub training_steps: usize,
    /// Loss at the last step.
    pub final_loss: Option<f64>,
    /// Whether optimizer moments are stored alongside the weights.
    pub includes_optimizer_state: bool,
}

impl AdapterMetadata {
    /// Metadata for a fresh export, timestamped now.
    pub fn new(
        rank: usize,
        alpha: f32,
        target_modules: Vec<String>,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            adapter_type: ADAPTER_TYPE.to_string(),
            format_version: FORMAT_VERSION.to_string(),
            rank,
            alpha,
            scaling: lorastep_core::scaling_for(alpha, rank),
            target_modules,
            created_at: chrono::Utc::now().to_rfc3339(),
            model_name: model_name.into(),
            training_steps: 0,
            final_loss: None,
            includes_optimizer_state: false,
        }
    }

    /// Record training provenance.
    pub fn with_training(mut self, steps: usize, final_loss: Option<f64>) -> Self {
        self.training_steps = steps;
        self.final_loss = final_loss;
        self
    }

    /// Encode as the `__metadata__` string map.
    pub fn to_map(&self) -> Result<BTreeMap<String, String>, AdapterError> {
        let mut map = BTreeMap::new();
        map.insert("adapter_type".into(), self.adapter_type.clone());
        map.insert("format_version".into(), self.format_version.clone());
        map.insert("rank".into(), self.rank.to_string());
        map.insert("alpha".into(), self.alpha.to_string());
        map.insert("scaling".into(), self.scaling.to_string());
        map.insert(
            "target_modules".into(),
            serde_json::to_string(&self.target_modules)?,
        );
        map.insert("created_at".into(), self.created_at.clone());
        map.insert("model_name".into(), self.model_name.clone());
        map.insert("training_steps".into(), self.training_steps.to_string());
        if let Some(loss) = self.final_loss {
            map.insert("final_loss".into(), loss.to_string());
        }
        map.insert(
            "includes_optimizer_state".into(),
            self.includes_optimizer_state.to_string(),
        );
        Ok(map)
    }

    /// Decode from the `__metadata__` string map.
    ///
    /// `adapter_type` must be `lora`; `rank` and `alpha` are required and
    /// everything else falls back to a default.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, AdapterError> {
        check_adapter_type(map)?;

        let rank: usize = parse_field(map, "rank")?
            .ok_or_else(|| missing("rank"))?;
        let alpha: f32 = parse_field(map, "alpha")?.ok_or_else(|| missing("alpha"))?;
        let target_modules = match map.get("target_modules") {
            Some(raw) => serde_json::from_str(raw).map_err(|e| AdapterError::InvalidMetadata {
                field: "target_modules",
                reason: e.to_string(),
            })?,
            None => Vec::new(),
        };

        Ok(Self {
            adapter_type: ADAPTER_TYPE.to_string(),
            format_version: map
                .get("format_version")
                .cloned()
                .unwrap_or_else(|| FORMAT_VERSION.to_string()),
            rank,
            alpha,
            scaling: parse_field(map, "scaling")?
                .unwrap_or_else(|| lorastep_core::scaling_for(alpha, rank)),
            target_modules,
            created_at: map.get("created_at").cloned().unwrap_or_default(),
            model_name: map.get("model_name").cloned().unwrap_or_default(),
            training_steps: parse_field(map, "training_steps")?.unwrap_or(0),
            final_loss: parse_field(map, "final_loss")?,
            includes_optimizer_state: parse_field(map, "includes_optimizer_state")?
                .unwrap_or(false),
        })
    }
}

pub(crate) fn check_adapter_type(map: &BTreeMap<String, String>) -> Result<(), AdapterError> {
    match map.get("adapter_type") {
        Some(kind) if kind == ADAPTER_TYPE => Ok(()),
        other => Err(AdapterError::UnknownAdapterType(other.cloned())),
    }
}

fn missing(field: &'static str) -> AdapterError {
    AdapterError::InvalidMetadata {
        field,
        reason: "missing".to_string(),
    }
}

fn parse_field<T>(map: &BTreeMap<String, String>, field: &'static str) -> Result<Option<T>, AdapterError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    map.get(field)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| AdapterError::InvalidMetadata {
                field,
                reason: format!("'{raw}': {e}"),
            })
        })
        .transpose()
}

/// Role of a tensor inside an adapter file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TensorRole {
    /// `lora_A.weight`
    AWeight,
    /// `lora_B.weight`
    BWeight,
    /// `lora_A.exp_avg`
    AExpAvg,
    /// `lora_A.exp_avg_sq`
    AExpAvgSq,
    /// `lora_B.exp_avg`
    BExpAvg,
    /// `lora_B.exp_avg_sq`
    BExpAvgSq,
}

impl TensorRole {
    const ALL: [TensorRole; 6] = [
        TensorRole::AWeight,
        TensorRole::BWeight,
        TensorRole::AExpAvg,
        TensorRole::AExpAvgSq,
        TensorRole::BExpAvg,
        TensorRole::BExpAvgSq,
    ];

    /// Name suffix, including the leading dot.
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::AWeight => ".lora_A.weight",
            Self::BWeight => ".lora_B.weight",
            Self::AExpAvg => ".lora_A.exp_avg",
            Self::AExpAvgSq => ".lora_A.exp_avg_sq",
            Self::BExpAvg => ".lora_B.exp_avg",
            Self::BExpAvgSq => ".lora_B.exp_avg_sq",
        }
    }

    /// Full tensor name for `layer`.
    pub fn tensor_name(self, layer: &str) -> String {
        format!("{layer}{}", self.suffix())
    }

    /// Split a tensor name into layer prefix and role.
    pub fn parse(name: &str) -> Option<(&str, TensorRole)> {
        Self::ALL.into_iter().find_map(|role| {
            name.strip_suffix(role.suffix())
                .filter(|layer| !layer.is_empty())
                .map(|layer| (layer, role))
        })
    }
}

type RoleMap<'a> = BTreeMap<TensorRole, (&'a str, &'a TensorData)>;

fn fetch_role(roles: &RoleMap<'_>, layer: &str, role: TensorRole) -> Result<WeightMatrix, AdapterError> {
    let (name, tensor) = roles.get(&role).ok_or_else(|| {
        AdapterError::Malformed(format!(
            "layer '{layer}' is missing {}",
            role.suffix().trim_start_matches('.')
        ))
    })?;
    WeightMatrix::from_tensor(name, tensor)
}

/// Host copy of a 2-D matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightMatrix {
    /// `[rows, cols]`.
    pub shape: Vec<usize>,
    /// Row-major values.
    pub data: Vec<f32>,
}

impl WeightMatrix {
    fn to_tensor(&self) -> TensorData {
        TensorData::from_f32(self.shape.clone(), &self.data)
    }

    fn from_tensor(name: &str, tensor: &TensorData) -> Result<Self, AdapterError> {
        Ok(Self {
            shape: tensor.shape.clone(),
            data: tensor.to_f32(name)?,
        })
    }
}

/// A and B of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerWeights {
    /// `[in_features, rank]`.
    #[serde(rename = "A")]
    pub a: WeightMatrix,
    /// `[rank, out_features]`.
    #[serde(rename = "B")]
    pub b: WeightMatrix,
}

/// Dequantized Adam moments of one matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerMoments {
    /// First moment.
    pub exp_avg: WeightMatrix,
    /// Second moment.
    pub exp_avg_sq: WeightMatrix,
}

/// Optimizer moments for A and B of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerOptimizerState {
    /// Moments of A.
    #[serde(rename = "A")]
    pub a: OptimizerMoments,
    /// Moments of B.
    #[serde(rename = "B")]
    pub b: OptimizerMoments,
}

/// A trained adapter held in host memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterData {
    /// Provenance and hyperparameters.
    pub metadata: AdapterMetadata,
    /// Weights per layer name.
    pub layers: BTreeMap<String, LayerWeights>,
    /// Optional optimizer moments per layer name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub optimizer_state: BTreeMap<String, LayerOptimizerState>,
}

impl AdapterData {
    /// Ordered tensors: each layer's A and B, then its moments if present.
    pub fn to_tensors(&self) -> NamedTensors {
        let mut tensors = Vec::with_capacity(self.layers.len() * 2);
        for (layer, weights) in &self.layers {
            tensors.push((TensorRole::AWeight.tensor_name(layer), weights.a.to_tensor()));
            tensors.push((TensorRole::BWeight.tensor_name(layer), weights.b.to_tensor()));
        }
        for (layer, state) in &self.optimizer_state {
            for (role, matrix) in [
                (TensorRole::AExpAvg, &state.a.exp_avg),
                (TensorRole::AExpAvgSq, &state.a.exp_avg_sq),
                (TensorRole::BExpAvg, &state.b.exp_avg),
                (TensorRole::BExpAvgSq, &state.b.exp_avg_sq),
            ] {
                tensors.push((role.tensor_name(layer), matrix.to_tensor()));
            }
        }
        tensors
    }

    /// Encode to adapter file bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AdapterError> {
        let mut metadata = self.metadata.clone();
        metadata.includes_optimizer_state = !self.optimizer_state.is_empty();
        serialize(&self.to_tensors(), &metadata.to_map()?)
    }

    /// Decode from adapter file bytes.
    ///
    /// Every layer needs both A and B; tensors with unrecognised names are
    /// skipped (see [`crate::validate_adapter_file`] for diagnostics).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AdapterError> {
        let (tensors, map) = deserialize(bytes)?;
        let metadata = AdapterMetadata::from_map(&map)?;

        let mut by_layer: BTreeMap<&str, RoleMap<'_>> = BTreeMap::new();
        for (name, tensor) in &tensors {
            if let Some((layer, role)) = TensorRole::parse(name) {
                by_layer
                    .entry(layer)
                    .or_default()
                    .insert(role, (name.as_str(), tensor));
            }
        }

        let mut layers = BTreeMap::new();
        let mut optimizer_state = BTreeMap::new();
        for (layer, roles) in &by_layer {
            let weights = LayerWeights {
                a: fetch_role(roles, layer, TensorRole::AWeight)?,
                b: fetch_role(roles, layer, TensorRole::BWeight)?,
            };
            layers.insert(layer.to_string(), weights);

            if roles.contains_key(&TensorRole::AExpAvg) {
                let state = LayerOptimizerState {
                    a: OptimizerMoments {
                        exp_avg: fetch_role(roles, layer, TensorRole::AExpAvg)?,
                        exp_avg_sq: fetch_role(roles, layer, TensorRole::AExpAvgSq)?,
                    },
                    b: OptimizerMoments {
                        exp_avg: fetch_role(roles, layer, TensorRole::BExpAvg)?,
                        exp_avg_sq: fetch_role(roles, layer, TensorRole::BExpAvgSq)?,
                    },
                };
                optimizer_state.insert(layer.to_string(), state);
            }
        }

        Ok(Self {
            metadata,
            layers,
            optimizer_state,
        })
    }

    /// Write the adapter file to disk.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), AdapterError> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Read an adapter file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AdapterError> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}
