//! Data-ingress contract and validation.
//!
//! Parsed arrays arrive from the file-loading collaborator as a flat byte
//! buffer plus shape/dtype/order metadata. Validation runs before the solver
//! ever sees the data: errors gate the session, warnings are advisory and
//! surface in the UI alongside basic statistics.

use crate::error::EngineError;
use serde::Serialize;

/// Supported element types, little-endian only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Dtype {
    F64,
    F32,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
}

impl Dtype {
    pub fn item_size(&self) -> usize {
        match self {
            Dtype::F64 => 8,
            Dtype::F32 | Dtype::I32 | Dtype::U32 => 4,
            Dtype::I16 | Dtype::U16 => 2,
            Dtype::I8 | Dtype::U8 => 1,
        }
    }

    /// Parse a numpy-style descr such as `<f8`, `|i1` or `=u2`. Big-endian
    /// (`>`) data is rejected outright.
    pub fn from_descr(descr: &str) -> Result<Dtype, EngineError> {
        let code = match descr.as_bytes().first() {
            Some(b'<') | Some(b'=') | Some(b'|') => &descr[1..],
            Some(b'>') => {
                return Err(EngineError::IoFormat(format!(
                    "big-endian data is not supported: {descr}"
                )))
            }
            _ => descr,
        };

        match code {
            "f8" => Ok(Dtype::F64),
            "f4" => Ok(Dtype::F32),
            "i1" => Ok(Dtype::I8),
            "u1" => Ok(Dtype::U8),
            "i2" => Ok(Dtype::I16),
            "u2" => Ok(Dtype::U16),
            "i4" => Ok(Dtype::I32),
            "u4" => Ok(Dtype::U32),
            other => Err(EngineError::IoFormat(format!("unsupported dtype: {other}"))),
        }
    }
}

/// A parsed 2-D array exactly as the loader hands it over.
#[derive(Debug, Clone)]
pub struct ParsedArray {
    pub data: Vec<u8>,
    pub shape: [usize; 2],
    pub dtype: Dtype,
    pub fortran_order: bool,
}

/// Summary statistics over the finite samples.
#[derive(Debug, Clone, Serialize)]
pub struct ArrayStats {
    pub rows: usize,
    pub cols: usize,
    pub nan_count: usize,
    pub inf_count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

/// Validation outcome: `errors` gate the session, `warnings` are advisory.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub stats: Option<ArrayStats>,
}

impl ParsedArray {
    fn element_count(&self) -> usize {
        self.shape[0] * self.shape[1]
    }

    /// Decode one element at a flat (storage-order) index. The try_into
    /// unwraps cannot fail: the slice width equals the dtype item size, and
    /// callers run only after the byte-length check in `validate`.
    fn value_at(&self, idx: usize) -> f64 {
        let size = self.dtype.item_size();
        let bytes = &self.data[idx * size..(idx + 1) * size];
        match self.dtype {
            Dtype::F64 => f64::from_le_bytes(bytes.try_into().unwrap()),
            Dtype::F32 => f32::from_le_bytes(bytes.try_into().unwrap()) as f64,
            Dtype::I8 => i8::from_le_bytes(bytes.try_into().unwrap()) as f64,
            Dtype::U8 => u8::from_le_bytes(bytes.try_into().unwrap()) as f64,
            Dtype::I16 => i16::from_le_bytes(bytes.try_into().unwrap()) as f64,
            Dtype::U16 => u16::from_le_bytes(bytes.try_into().unwrap()) as f64,
            Dtype::I32 => i32::from_le_bytes(bytes.try_into().unwrap()) as f64,
            Dtype::U32 => u32::from_le_bytes(bytes.try_into().unwrap()) as f64,
        }
    }

    /// Validate shape, byte length and content. The solver is only allowed
    /// to see arrays whose report says `valid`.
    pub fn validate(&self) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let [rows, cols] = self.shape;
        if rows == 0 || cols == 0 {
            errors.push(format!("empty array: shape [{rows}, {cols}]"));
        }

        let expected = self.element_count() * self.dtype.item_size();
        if self.data.len() != expected {
            errors.push(format!(
                "buffer holds {} bytes, expected {}",
                self.data.len(),
                expected
            ));
        }

        let stats = if errors.is_empty() {
            let mut nan_count = 0usize;
            let mut inf_count = 0usize;
            let mut min = f64::INFINITY;
            let mut max = f64::NEG_INFINITY;
            let mut sum = 0.0_f64;
            let mut finite = 0usize;

            for i in 0..self.element_count() {
                let v = self.value_at(i);
                if v.is_nan() {
                    nan_count += 1;
                } else if v.is_infinite() {
                    inf_count += 1;
                } else {
                    min = min.min(v);
                    max = max.max(v);
                    sum += v;
                    finite += 1;
                }
            }

            if finite == 0 {
                errors.push("array contains no finite values".into());
            }
            if nan_count > 0 {
                warnings.push(format!("{nan_count} NaN values"));
            }
            if inf_count > 0 {
                warnings.push(format!("{inf_count} infinite values"));
            }
            if rows > cols {
                warnings.push(format!(
                    "suspicious shape [{rows}, {cols}]: more cells than timepoints; \
                     check the axis order"
                ));
            }

            Some(ArrayStats {
                rows,
                cols,
                nan_count,
                inf_count,
                min: if finite > 0 { min } else { f64::NAN },
                max: if finite > 0 { max } else { f64::NAN },
                mean: if finite > 0 { sum / finite as f64 } else { f64::NAN },
            })
        } else {
            None
        };

        ValidationReport {
            valid: errors.is_empty(),
            errors,
            warnings,
            stats,
        }
    }

    /// Decode into a row-major cells × time f32 matrix. `swap_axes` inverts
    /// the cells/time interpretation (for files saved time-major). Fails on
    /// any validation error.
    pub fn to_matrix(&self, swap_axes: bool) -> Result<(Vec<f32>, usize, usize), EngineError> {
        let report = self.validate();
        if !report.valid {
            return Err(EngineError::IoFormat(report.errors.join("; ")));
        }

        let [rows, cols] = self.shape;
        let (num_cells, num_timepoints) = if swap_axes { (cols, rows) } else { (rows, cols) };

        let mut out = vec![0.0_f32; rows * cols];
        for cell in 0..num_cells {
            for t in 0..num_timepoints {
                // Logical (row, col) in the file's shape
                let (r, c) = if swap_axes { (t, cell) } else { (cell, t) };
                let flat = if self.fortran_order {
                    c * rows + r
                } else {
                    r * cols + c
                };
                out[cell * num_timepoints + t] = self.value_at(flat) as f32;
            }
        }

        Ok((out, num_cells, num_timepoints))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_array(values: &[f32], shape: [usize; 2]) -> ParsedArray {
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        ParsedArray {
            data,
            shape,
            dtype: Dtype::F32,
            fortran_order: false,
        }
    }

    #[test]
    fn descr_parsing() {
        assert_eq!(Dtype::from_descr("<f8").unwrap(), Dtype::F64);
        assert_eq!(Dtype::from_descr("<f4").unwrap(), Dtype::F32);
        assert_eq!(Dtype::from_descr("|i1").unwrap(), Dtype::I8);
        assert_eq!(Dtype::from_descr("=u2").unwrap(), Dtype::U16);
        assert_eq!(Dtype::from_descr("i4").unwrap(), Dtype::I32);
        assert!(Dtype::from_descr(">f8").is_err(), "big-endian must be rejected");
        assert!(Dtype::from_descr("<c8").is_err(), "complex unsupported");
    }

    #[test]
    fn valid_array_passes_with_stats() {
        let arr = f32_array(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]);
        let report = arr.validate();
        assert!(report.valid);
        assert!(report.errors.is_empty());
        let stats = report.stats.unwrap();
        assert_eq!(stats.rows, 2);
        assert_eq!(stats.cols, 3);
        assert!((stats.mean - 3.5).abs() < 1e-9);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 6.0);
    }

    #[test]
    fn empty_and_mismatched_arrays_are_errors() {
        let empty = f32_array(&[], [0, 3]);
        assert!(!empty.validate().valid);

        let mut short = f32_array(&[1.0, 2.0, 3.0], [2, 3]);
        short.data.truncate(8);
        let report = short.validate();
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("bytes")));
    }

    #[test]
    fn all_nan_is_an_error_partial_nan_a_warning() {
        let all_nan = f32_array(&[f32::NAN; 6], [2, 3]);
        let report = all_nan.validate();
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("finite")));

        let some_nan = f32_array(&[1.0, f32::NAN, 3.0, 4.0, 5.0, 6.0], [2, 3]);
        let report = some_nan.validate();
        assert!(report.valid);
        assert!(report.warnings.iter().any(|w| w.contains("NaN")));
    }

    #[test]
    fn tall_shape_warns_about_axis_order() {
        let arr = f32_array(&[0.0; 12], [4, 3]);
        let report = arr.validate();
        assert!(report.valid);
        assert!(report.warnings.iter().any(|w| w.contains("axis order")));
    }

    #[test]
    fn to_matrix_row_major() {
        let arr = f32_array(&[1.0, 2.0, 3.0, 10.0, 20.0, 30.0], [2, 3]);
        let (m, cells, time) = arr.to_matrix(false).unwrap();
        assert_eq!((cells, time), (2, 3));
        assert_eq!(m, vec![1.0, 2.0, 3.0, 10.0, 20.0, 30.0]);
    }

    #[test]
    fn to_matrix_fortran_order() {
        // Same logical matrix stored column-major:
        // [[1, 2, 3], [10, 20, 30]] → columns (1,10), (2,20), (3,30)
        let arr = ParsedArray {
            fortran_order: true,
            ..f32_array(&[1.0, 10.0, 2.0, 20.0, 3.0, 30.0], [2, 3])
        };
        let (m, _, _) = arr.to_matrix(false).unwrap();
        assert_eq!(m, vec![1.0, 2.0, 3.0, 10.0, 20.0, 30.0]);
    }

    #[test]
    fn to_matrix_swapped_axes() {
        // File is time-major [3 timepoints, 2 cells]; swap interprets
        // columns as cells.
        let arr = f32_array(&[1.0, 10.0, 2.0, 20.0, 3.0, 30.0], [3, 2]);
        let (m, cells, time) = arr.to_matrix(true).unwrap();
        assert_eq!((cells, time), (2, 3));
        assert_eq!(m, vec![1.0, 2.0, 3.0, 10.0, 20.0, 30.0]);
    }

    #[test]
    fn integer_dtypes_decode() {
        let mut data = Vec::new();
        for v in [-1i16, 0, 1, 300, -300, 32000] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let arr = ParsedArray {
            data,
            shape: [1, 6],
            dtype: Dtype::I16,
            fortran_order: false,
        };
        let (m, _, _) = arr.to_matrix(false).unwrap();
        assert_eq!(m, vec![-1.0, 0.0, 1.0, 300.0, -300.0, 32000.0]);
    }
}
