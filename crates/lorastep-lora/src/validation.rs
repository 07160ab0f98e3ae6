//! Adapter file inspection.
//!
//! Unreadable files and foreign adapter types are hard errors. Everything
//! else that looks off is collected as a [`ValidationWarning`] so tooling can
//! still show a partial file to the user.

use std::collections::BTreeMap;
use std::fmt;

use tracing::warn;

use crate::adapter::{
    check_adapter_type, deserialize, AdapterMetadata, TensorRole, FORMAT_VERSION,
};
use crate::error::AdapterError;

/// Non-fatal finding about an adapter file.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationWarning {
    /// A layer has one of A/B but not the other.
    MissingPair {
        /// Layer prefix.
        layer: String,
        /// Name of the absent tensor.
        missing: String,
    },
    /// Tensor name does not follow `{layer}.lora_{A,B}.{weight,exp_avg,exp_avg_sq}`.
    UnexpectedTensorName(String),
    /// Adapter weight is not 2-D.
    UnexpectedShape {
        /// Tensor name.
        name: String,
        /// Declared shape.
        shape: Vec<usize>,
    },
    /// `format_version` missing or different from the one this codec writes.
    UnusualFormatVersion(Option<String>),
    /// Columns of A disagree with rows of B.
    RankMismatch {
        /// Layer prefix.
        layer: String,
        /// Rank implied by A.
        a_rank: usize,
        /// Rank implied by B.
        b_rank: usize,
    },
    /// Metadata rank disagrees with the stored tensors.
    MetadataRankMismatch {
        /// Layer prefix.
        layer: String,
        /// Rank recorded in metadata.
        metadata_rank: usize,
        /// Rank implied by the tensors.
        tensor_rank: usize,
    },
    /// Metadata could not be fully decoded.
    IncompleteMetadata(String),
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPair { layer, missing } => {
                write!(f, "layer '{layer}' has no matching {missing}")
            }
            Self::UnexpectedTensorName(name) => write!(f, "unexpected tensor name '{name}'"),
            Self::UnexpectedShape { name, shape } => {
                write!(f, "tensor '{name}' has non-matrix shape {shape:?}")
            }
            Self::UnusualFormatVersion(Some(v)) => {
                write!(f, "format version {v} (expected {FORMAT_VERSION})")
            }
            Self::UnusualFormatVersion(None) => write!(f, "format version missing"),
            Self::RankMismatch {
                layer,
                a_rank,
                b_rank,
            } => write!(f, "layer '{layer}': A rank {a_rank} != B rank {b_rank}"),
            Self::MetadataRankMismatch {
                layer,
                metadata_rank,
                tensor_rank,
            } => write!(
                f,
                "layer '{layer}': tensors have rank {tensor_rank}, metadata says {metadata_rank}"
            ),
            Self::IncompleteMetadata(reason) => write!(f, "incomplete metadata: {reason}"),
        }
    }
}

/// Result of inspecting an adapter file.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    /// Raw `__metadata__` map.
    pub metadata: BTreeMap<String, String>,
    /// Decoded metadata, when it parses.
    pub adapter_metadata: Option<AdapterMetadata>,
    /// Layers that have both A and B.
    pub complete_layers: Vec<String>,
    /// Number of tensors in the file.
    pub num_tensors: usize,
    /// Non-fatal findings, in discovery order.
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    /// True when nothing was flagged.
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

#[derive(Default)]
struct LayerEntry {
    a_rank: Option<usize>,
    b_rank: Option<usize>,
    has_a: bool,
    has_b: bool,
}

/// Inspect an adapter file without importing it.
pub fn validate_adapter_file(bytes: &[u8]) -> Result<ValidationReport, AdapterError> {
    let (tensors, metadata) = deserialize(bytes)?;
    check_adapter_type(&metadata)?;

    let mut warnings = Vec::new();
    match metadata.get("format_version") {
        Some(v) if v == FORMAT_VERSION => {}
        other => warnings.push(ValidationWarning::UnusualFormatVersion(other.cloned())),
    }

    let adapter_metadata = match AdapterMetadata::from_map(&metadata) {
        Ok(meta) => Some(meta),
        Err(e) => {
            warnings.push(ValidationWarning::IncompleteMetadata(e.to_string()));
            None
        }
    };

    let mut layers: BTreeMap<String, LayerEntry> = BTreeMap::new();
    for (name, tensor) in &tensors {
        let Some((layer, role)) = TensorRole::parse(name) else {
            warnings.push(ValidationWarning::UnexpectedTensorName(name.clone()));
            continue;
        };
        if !matches!(role, TensorRole::AWeight | TensorRole::BWeight) {
            continue;
        }
        if tensor.shape.len() != 2 {
            warnings.push(ValidationWarning::UnexpectedShape {
                name: name.clone(),
                shape: tensor.shape.clone(),
            });
        }
        let entry = layers.entry(layer.to_string()).or_default();
        if role == TensorRole::AWeight {
            entry.has_a = true;
            entry.a_rank = tensor.shape.get(1).copied();
        } else {
            entry.has_b = true;
            entry.b_rank = tensor.shape.first().copied();
        }
    }

    let mut complete_layers = Vec::new();
    for (layer, entry) in &layers {
        let missing = match (entry.has_a, entry.has_b) {
            (true, false) => Some(TensorRole::BWeight),
            (false, true) => Some(TensorRole::AWeight),
            _ => None,
        };
        if let Some(role) = missing {
            warnings.push(ValidationWarning::MissingPair {
                layer: layer.clone(),
                missing: role.tensor_name(layer),
            });
            continue;
        }
        complete_layers.push(layer.clone());

        if let (Some(a_rank), Some(b_rank)) = (entry.a_rank, entry.b_rank) {
            if a_rank != b_rank {
                warnings.push(ValidationWarning::RankMismatch {
                    layer: layer.clone(),
                    a_rank,
                    b_rank,
                });
            } else if let Some(meta) = &adapter_metadata {
                if meta.rank != a_rank {
                    warnings.push(ValidationWarning::MetadataRankMismatch {
                        layer: layer.clone(),
                        metadata_rank: meta.rank,
                        tensor_rank: a_rank,
                    });
                }
            }
        }
    }

    for warning in &warnings {
        warn!(%warning, "Adapter validation");
    }

    Ok(ValidationReport {
        metadata,
        adapter_metadata,
        complete_layers,
        num_tensors: tensors.len(),
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{serialize, TensorData};

    fn lora_metadata() -> BTreeMap<String, String> {
        AdapterMetadata::new(2, 4.0, vec!["q_proj".into()], "tiny")
            .to_map()
            .unwrap()
    }

    fn matrix(rows: usize, cols: usize) -> TensorData {
        TensorData::from_f32(vec![rows, cols], &vec![0.5; rows * cols])
    }

    #[test]
    fn test_clean_file() {
        let tensors = vec![
            ("l0.q_proj.lora_A.weight".to_string(), matrix(4, 2)),
            ("l0.q_proj.lora_B.weight".to_string(), matrix(2, 4)),
        ];
        let bytes = serialize(&tensors, &lora_metadata()).unwrap();
        let report = validate_adapter_file(&bytes).unwrap();
        assert!(report.is_clean(), "{:?}", report.warnings);
        assert_eq!(report.complete_layers, vec!["l0.q_proj".to_string()]);
        assert_eq!(report.num_tensors, 2);
    }

    #[test]
    fn test_empty_rejected() {
        assert!(matches!(validate_adapter_file(&[]), Err(AdapterError::Empty)));
    }

    #[test]
    fn test_garbage_rejected() {
        let mut bytes = 1000u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"not json");
        assert!(matches!(
            validate_adapter_file(&bytes),
            Err(AdapterError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_adapter_type_rejected() {
        let mut metadata = lora_metadata();
        metadata.insert("adapter_type".into(), "ia3".into());
        let bytes = serialize(&[], &metadata).unwrap();
        assert!(matches!(
            validate_adapter_file(&bytes),
            Err(AdapterError::UnknownAdapterType(Some(t))) if t == "ia3"
        ));

        let bytes = serialize(&[], &BTreeMap::new()).unwrap();
        assert!(matches!(
            validate_adapter_file(&bytes),
            Err(AdapterError::UnknownAdapterType(None))
        ));
    }

    #[test]
    fn test_partial_file_warns() {
        let mut metadata = lora_metadata();
        metadata.insert("format_version".into(), "0.9".into());
        let tensors = vec![
            ("l0.q_proj.lora_A.weight".to_string(), matrix(4, 2)),
            ("l1.q_proj.lora_A.weight".to_string(), matrix(4, 2)),
            ("l1.q_proj.lora_B.weight".to_string(), matrix(3, 4)),
            ("lm_head.weight".to_string(), matrix(1, 1)),
        ];
        let bytes = serialize(&tensors, &metadata).unwrap();
        let report = validate_adapter_file(&bytes).unwrap();

        assert_eq!(
            report.warnings,
            vec![
                ValidationWarning::UnusualFormatVersion(Some("0.9".into())),
                ValidationWarning::UnexpectedTensorName("lm_head.weight".into()),
                ValidationWarning::MissingPair {
                    layer: "l0.q_proj".into(),
                    missing: "l0.q_proj.lora_B.weight".into(),
                },
                ValidationWarning::RankMismatch {
                    layer: "l1.q_proj".into(),
                    a_rank: 2,
                    b_rank: 3,
                },
            ]
        );
        assert_eq!(report.complete_layers, vec!["l1.q_proj".to_string()]);
    }

    #[test]
    fn test_metadata_rank_mismatch() {
        let tensors = vec![
            ("l0.lora_A.weight".to_string(), matrix(4, 3)),
            ("l0.lora_B.weight".to_string(), matrix(3, 4)),
        ];
        let bytes = serialize(&tensors, &lora_metadata()).unwrap();
        let report = validate_adapter_file(&bytes).unwrap();
        assert_eq!(
            report.warnings,
            vec![ValidationWarning::MetadataRankMismatch {
                layer: "l0".into(),
                metadata_rank: 2,
                tensor_rank: 3,
            }]
        );
    }
}
