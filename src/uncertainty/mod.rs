//! Uncertainty estimation and calibration methods

pub mod bbp;
pub mod focal;
pub mod iso;
pub mod sgld;
pub mod snapshot;
pub mod swag;
pub mod ts;

pub use bbp::{BbpLinear, BbpLinearConfig};
pub use focal::FocalLoss;
pub use iso::{IsotonicCalibration, IsotonicRegression};
pub use sgld::{Sgld, SgldConfig};
pub use snapshot::ParamSnapshot;
pub use swag::Swag;
pub use ts::{fit_temperature, TemperatureScaler};
