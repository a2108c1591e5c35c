//! Model persistence: a zip archive of NPY v1.0 typed arrays.
//!
//! Entry order (§4.4): `weight_0.npy`, `bias_0.npy`, `weight_1.npy`,
//! `bias_1.npy`, ... one pair per layer, then a trailing `activations.npy`
//! holding the activation names as a fixed-width NUL-padded byte-string
//! array. No `npy`/`npz` crate exists among this crate's dependencies, so
//! both directions of the format are hand-rolled here, following the same
//! `{name}.npy`-per-entry convention numpy's own `.npz` writer uses.

use std::io::{Read, Write};
use std::path::Path;

use rand::Rng;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::activations::ActivationRegistry;
use crate::errors::{GPError, GPResult};
use crate::network::Network;

const MAGIC: [u8; 6] = [0x93, b'N', b'U', b'M', b'P', b'Y'];
const ALIGNMENT: usize = 64;

fn build_header(descr: &str, fortran_order: bool, shape: &[usize]) -> Vec<u8> {
    let shape_str = match shape {
        [] => String::new(),
        [n] => format!("{n},"),
        rest => rest.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(", "),
    };
    let dict = format!(
        "{{'descr': '{descr}', 'fortran_order': {}, 'shape': ({shape_str}), }}",
        if fortran_order { "True" } else { "False" }
    );

    // Pad with spaces and a trailing newline so MAGIC + version(2) +
    // header-length field(2) + dict is a multiple of ALIGNMENT bytes.
    let preamble_len = MAGIC.len() + 2 + 2;
    let unpadded = preamble_len + dict.len() + 1;
    let padded_total = unpadded.div_ceil(ALIGNMENT) * ALIGNMENT;
    let pad = padded_total - unpadded;

    let mut dict_bytes = dict.into_bytes();
    dict_bytes.extend(std::iter::repeat(b' ').take(pad));
    dict_bytes.push(b'\n');

    let header_len = dict_bytes.len() as u16;

    let mut out = Vec::with_capacity(padded_total);
    out.extend_from_slice(&MAGIC);
    out.push(1); // major version
    out.push(0); // minor version
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(&dict_bytes);
    out
}

fn encode_f32_array(shape: &[usize], data: &[f32]) -> Vec<u8> {
    let mut out = build_header("<f4", false, shape);
    out.reserve(data.len() * 4);
    for &v in data {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Encodes `names` as a fixed-width `|S{width}` byte-string array, each
/// entry left-justified and NUL-padded to `width`.
fn encode_ascii_array(names: &[&str]) -> Vec<u8> {
    let width = names.iter().map(|n| n.len()).max().unwrap_or(1).max(1);
    let mut out = build_header(&format!("|S{width}"), false, &[names.len()]);
    for name in names {
        let bytes = name.as_bytes();
        out.extend_from_slice(bytes);
        out.extend(std::iter::repeat(0u8).take(width - bytes.len()));
    }
    out
}

enum DecodedArray {
    Float32 { shape: Vec<usize>, data: Vec<f32> },
    Ascii { width: usize, names: Vec<String> },
}

fn find_between<'a>(haystack: &'a str, start: &str, end: char) -> Option<&'a str> {
    let from = haystack.find(start)? + start.len();
    let rest = &haystack[from..];
    let to = rest.find(end)?;
    Some(&rest[..to])
}

fn decode_npy(bytes: &[u8], path: &str, name: &str) -> GPResult<DecodedArray> {
    let archive_err = |reason: String| GPError::Archive {
        path: path.to_string(),
        reason: format!("array '{name}': {reason}"),
    };

    if bytes.len() < 10 || bytes[0..6] != MAGIC {
        return Err(archive_err("missing NPY magic string".to_string()));
    }
    let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
    let header_start = 10;
    let header_end = header_start + header_len;
    if bytes.len() < header_end {
        return Err(archive_err("truncated NPY header".to_string()));
    }
    let header = std::str::from_utf8(&bytes[header_start..header_end])
        .map_err(|e| archive_err(format!("header is not valid utf-8: {e}")))?;

    let descr = find_between(header, "'descr': '", '\'').ok_or_else(|| archive_err("missing descr".to_string()))?;
    let fortran_order = find_between(header, "'fortran_order': ", ',')
        .map(|s| s.trim() == "True")
        .unwrap_or(false);
    if fortran_order {
        return Err(GPError::FortranOrderUnsupported {
            path: path.to_string(),
            name: name.to_string(),
        });
    }
    let shape_str = find_between(header, "'shape': (", ')').ok_or_else(|| archive_err("missing shape".to_string()))?;
    let shape: Vec<usize> = shape_str
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().unwrap_or(0))
        .collect();

    let payload = &bytes[header_end..];
    let typechar = descr.chars().nth(1).unwrap_or('?');
    match typechar {
        'f' => {
            let n_elements: usize = shape.iter().product::<usize>().max(1);
            let mut data = Vec::with_capacity(n_elements);
            for chunk in payload.chunks_exact(4).take(n_elements) {
                data.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }
            Ok(DecodedArray::Float32 { shape, data })
        }
        'S' => {
            let width: usize = descr[2..].parse().unwrap_or(0);
            if width == 0 {
                return Err(archive_err("ascii array has zero element width".to_string()));
            }
            let count = shape.first().copied().unwrap_or(0);
            let mut names = Vec::with_capacity(count);
            for row in payload.chunks_exact(width).take(count) {
                let end = row.iter().position(|&b| b == 0).unwrap_or(row.len());
                names.push(String::from_utf8_lossy(&row[..end]).into_owned());
            }
            Ok(DecodedArray::Ascii { width, names })
        }
        other => Err(GPError::UnsupportedDtype {
            path: path.to_string(),
            name: name.to_string(),
            dtype: other,
        }),
    }
}

impl Network {
    /// Saves this network's parameters and activation names to `path` as a
    /// zip archive of NPY arrays (§4.4). Existing files at `path` are
    /// overwritten.
    pub fn save(&self, path: impl AsRef<Path>) -> GPResult<()> {
        let path = path.as_ref();
        let file = std::fs::File::create(path).map_err(|e| GPError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut zip = ZipWriter::new(file);
        let options: FileOptions = FileOptions::default().compression_method(CompressionMethod::Deflated);

        let archive_err = |reason: String| GPError::Archive {
            path: path.display().to_string(),
            reason,
        };

        for (i, layer) in self.layers.iter().enumerate() {
            zip.start_file(format!("weight_{i}.npy"), options)
                .map_err(|e| archive_err(e.to_string()))?;
            let weight_bytes = encode_f32_array(&[layer.n_in, layer.n_out], layer.weight.as_slice());
            zip.write_all(&weight_bytes).map_err(|e| GPError::Io {
                path: path.display().to_string(),
                source: e,
            })?;

            zip.start_file(format!("bias_{i}.npy"), options)
                .map_err(|e| archive_err(e.to_string()))?;
            let bias_bytes = encode_f32_array(&[layer.n_out], layer.bias.as_slice());
            zip.write_all(&bias_bytes).map_err(|e| GPError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
        }

        let names: Vec<&str> = self.layers.iter().map(|l| l.activation.name()).collect();
        zip.start_file("activations.npy", options)
            .map_err(|e| archive_err(e.to_string()))?;
        zip.write_all(&encode_ascii_array(&names)).map_err(|e| GPError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        zip.finish().map_err(|e| archive_err(e.to_string()))?;
        Ok(())
    }

    /// Inverse of [`Network::save`]: reconstructs a network from a zip
    /// archive of NPY arrays. Float32 arrays must alternate weight/bias and
    /// come in pairs (§4.4); the single ascii array supplies activation
    /// names, falling back to `linear` with a warning for any name the
    /// registry does not recognize.
    pub fn load(path: impl AsRef<Path>, registry: &ActivationRegistry) -> GPResult<Self> {
        let path_ref = path.as_ref();
        let path_str = path_ref.display().to_string();
        let file = std::fs::File::open(path_ref).map_err(|e| GPError::Io {
            path: path_str.clone(),
            source: e,
        })?;
        let mut archive = ZipArchive::new(file).map_err(|e| GPError::Archive {
            path: path_str.clone(),
            reason: e.to_string(),
        })?;

        let mut float_arrays: Vec<(Vec<usize>, Vec<f32>)> = Vec::new();
        let mut activation_names: Option<Vec<String>> = None;

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).map_err(|e| GPError::Archive {
                path: path_str.clone(),
                reason: e.to_string(),
            })?;
            let name = entry.name().to_string();
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).map_err(|e| GPError::Io {
                path: path_str.clone(),
                source: e,
            })?;

            match decode_npy(&bytes, &path_str, &name)? {
                DecodedArray::Float32 { shape, data } => float_arrays.push((shape, data)),
                DecodedArray::Ascii { names, .. } => activation_names = Some(names),
            }
        }

        if float_arrays.len() % 2 != 0 {
            return Err(GPError::OddArrayCount {
                path: path_str.clone(),
                count: float_arrays.len(),
            });
        }
        let n_layers = float_arrays.len() / 2;
        let names = activation_names.unwrap_or_default();

        let mut layers = Vec::with_capacity(n_layers);
        for i in 0..n_layers {
            let (weight_shape, weight_data) = &float_arrays[2 * i];
            let (bias_shape, bias_data) = &float_arrays[2 * i + 1];
            let (n_in, n_out) = match weight_shape.as_slice() {
                [n_in, n_out] => (*n_in, *n_out),
                other => {
                    return Err(GPError::Archive {
                        path: path_str.clone(),
                        reason: format!("weight_{i} has unexpected shape {other:?}"),
                    })
                }
            };
            if bias_shape != &[n_out] {
                return Err(GPError::Archive {
                    path: path_str.clone(),
                    reason: format!("bias_{i} shape {bias_shape:?} does not match weight_{i} n_out={n_out}"),
                });
            }
            if let Some(prev) = layers.last() {
                let prev_n_out: usize = prev.n_out;
                if prev_n_out != n_in {
                    return Err(GPError::ShapeMismatch {
                        layer: i,
                        expected: n_in,
                        found: prev_n_out,
                    });
                }
            }

            let activation_name = names.get(i).map(String::as_str).unwrap_or("linear");
            let activation = registry.by_name(activation_name).unwrap_or_else(|| {
                tracing::warn!(layer = i, requested = %activation_name, "unrecognized activation in saved model, falling back to linear");
                crate::activations::Activation::Linear
            });

            layers.push(crate::network::Layer {
                n_in,
                n_out,
                weight: crate::aligned::AlignedBuffer::from_slice(weight_data),
                bias: crate::aligned::AlignedBuffer::from_slice(bias_data),
                activation,
            });
        }

        Ok(Network {
            layers,
            loss: None,
            fused_output: false,
        })
    }
}

/// Used by tests to generate a throwaway path under the OS temp directory
/// without colliding across parallel test runs.
#[cfg(test)]
fn temp_model_path() -> std::path::PathBuf {
    let mut rng = rand::thread_rng();
    let suffix: u64 = rng.gen();
    std::env::temp_dir().join(format!("simd_neuralnet_test_{suffix}.npz"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Network;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn header_round_trips_float_array() {
        let data = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let bytes = encode_f32_array(&[2, 3], &data);
        match decode_npy(&bytes, "test", "arr").unwrap() {
            DecodedArray::Float32 { shape, data: decoded } => {
                assert_eq!(shape, vec![2, 3]);
                assert_eq!(decoded, data);
            }
            _ => panic!("expected float32 array"),
        }
    }

    #[test]
    fn header_round_trips_ascii_array() {
        let bytes = encode_ascii_array(&["relu", "sigmoid"]);
        match decode_npy(&bytes, "test", "activations").unwrap() {
            DecodedArray::Ascii { names, .. } => {
                assert_eq!(names, vec!["relu".to_string(), "sigmoid".to_string()]);
            }
            _ => panic!("expected ascii array"),
        }
    }

    #[test]
    fn save_then_load_reproduces_predictions_bit_for_bit() {
        let registry = ActivationRegistry::new();
        let mut net = Network::create(&[2, 3, 1], &["relu", "sigmoid"], &registry).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        net.initialize("auto", &mut rng);

        let path = temp_model_path();
        net.save(&path).unwrap();
        let loaded = Network::load(&path, &registry).unwrap();
        std::fs::remove_file(&path).ok();

        let input = vec![1.0f32, 1.0];
        let before = net.predict(&input).unwrap();
        let after = loaded.predict(&input).unwrap();
        assert_eq!(before, after);

        assert_eq!(loaded.layers[0].activation.name(), "relu");
        assert_eq!(loaded.layers[1].activation.name(), "sigmoid");
    }

    #[test]
    fn load_rejects_odd_array_count() {
        let registry = ActivationRegistry::new();
        let path = temp_model_path();
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = ZipWriter::new(file);
        let options: FileOptions = FileOptions::default().compression_method(CompressionMethod::Deflated);
        zip.start_file("weight_0.npy", options).unwrap();
        zip.write_all(&encode_f32_array(&[1, 1], &[0.0])).unwrap();
        zip.finish().unwrap();

        let err = Network::load(&path, &registry).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, GPError::OddArrayCount { .. }));
    }

    #[test]
    fn load_rejects_mismatched_adjacent_layer_shapes() {
        // layer 0: 2 -> 3, layer 1: 4 -> 1 — layer 1 expects n_in=4 but
        // layer 0 produces n_out=3, so this archive must be rejected rather
        // than loaded into a network that panics on the first `predict`.
        let registry = ActivationRegistry::new();
        let path = temp_model_path();
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = ZipWriter::new(file);
        let options: FileOptions = FileOptions::default().compression_method(CompressionMethod::Deflated);

        zip.start_file("weight_0.npy", options).unwrap();
        zip.write_all(&encode_f32_array(&[2, 3], &[0.0; 6])).unwrap();
        zip.start_file("bias_0.npy", options).unwrap();
        zip.write_all(&encode_f32_array(&[3], &[0.0; 3])).unwrap();

        zip.start_file("weight_1.npy", options).unwrap();
        zip.write_all(&encode_f32_array(&[4, 1], &[0.0; 4])).unwrap();
        zip.start_file("bias_1.npy", options).unwrap();
        zip.write_all(&encode_f32_array(&[1], &[0.0; 1])).unwrap();

        zip.start_file("activations.npy", options).unwrap();
        zip.write_all(&encode_ascii_array(&["linear", "linear"])).unwrap();
        zip.finish().unwrap();

        let err = Network::load(&path, &registry).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, GPError::ShapeMismatch { .. }));
    }
}
