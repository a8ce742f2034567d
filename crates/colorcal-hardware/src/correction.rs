//! Display correction matrices (CCMX).
//!
//! A correction matrix maps the instrument's XYZ for one display technology
//! onto reference-instrument XYZ. It is only valid on top of the base
//! calibration it was computed against, named by `cbid`.
//!
//! ```json
//! {
//!   "description": "WLED IPS, reference i1Pro 3",
//!   "cbid": "spyderx-00c0ffee",
//!   "matrix": [[1.02, 0.01, 0.0], [0.0, 0.99, 0.0], [0.0, 0.02, 1.05]]
//! }
//! ```

use colorcal_core::data::{ConversionProfile, Xyz};
use colorcal_core::error::{ColorError, ColorResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A 3×3 display correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionMatrix {
    /// Free text, usually the display type and reference instrument.
    #[serde(default)]
    pub description: String,
    /// Base calibration id the matrix was computed against.
    pub cbid: String,
    /// Row-major matrix applied to XYZ.
    pub matrix: [[f64; 3]; 3],
}

impl CorrectionMatrix {
    /// Read and validate a JSON correction file.
    pub fn load(path: &Path) -> ColorResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ColorError::Configuration(format!("cannot read correction {}: {e}", path.display()))
        })?;
        let ccmx: CorrectionMatrix = serde_json::from_str(&text).map_err(|e| {
            ColorError::Configuration(format!("invalid correction {}: {e}", path.display()))
        })?;
        ccmx.validate()?;
        tracing::info!(target: "colorcal::measure", path = %path.display(), cbid = %ccmx.cbid, "Loaded display correction");
        Ok(ccmx)
    }

    fn validate(&self) -> ColorResult<()> {
        if self.matrix.iter().flatten().any(|v| !v.is_finite()) {
            return Err(ColorError::Configuration(
                "correction matrix holds non-finite values".into(),
            ));
        }
        let m = &self.matrix;
        let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
        if det.abs() < 1e-9 {
            return Err(ColorError::Configuration(
                "correction matrix is singular".into(),
            ));
        }
        Ok(())
    }

    /// Reject a matrix computed for a different base calibration.
    pub fn check_base(&self, profile: &ConversionProfile) -> ColorResult<()> {
        if self.cbid != profile.base_id {
            return Err(ColorError::Configuration(format!(
                "correction was made for base calibration '{}', instrument has '{}'",
                self.cbid, profile.base_id
            )));
        }
        Ok(())
    }

    /// Correct one reading.
    pub fn apply(&self, xyz: Xyz) -> Xyz {
        xyz.transform(&self.matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_and_apply() {
        let file = write(
            r#"{"cbid": "simulated", "matrix": [[2,0,0],[0,1,0],[0,0,0.5]]}"#,
        );
        let ccmx = CorrectionMatrix::load(file.path()).unwrap();
        assert!(ccmx.description.is_empty());
        assert!(ccmx
            .check_base(&ConversionProfile::identity("simulated"))
            .is_ok());
        assert_eq!(
            ccmx.apply(Xyz::new(1.0, 2.0, 4.0)),
            Xyz::new(2.0, 2.0, 2.0)
        );
    }

    #[test]
    fn test_base_mismatch_is_rejected() {
        let ccmx = CorrectionMatrix {
            description: String::new(),
            cbid: "spyderx-00000001".into(),
            matrix: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        };
        assert!(matches!(
            ccmx.check_base(&ConversionProfile::identity("simulated")),
            Err(ColorError::Configuration(_))
        ));
    }

    #[test]
    fn test_singular_matrix_is_rejected() {
        let file = write(r#"{"cbid": "x", "matrix": [[1,2,3],[2,4,6],[0,0,1]]}"#);
        assert!(matches!(
            CorrectionMatrix::load(file.path()),
            Err(ColorError::Configuration(_))
        ));
    }
}
