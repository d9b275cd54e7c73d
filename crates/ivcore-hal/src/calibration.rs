//! Calibration collaborator: converts a measured photodiode or LED current
//! into irradiance.
//!
//! Curve fitting and calibration-file handling live outside the control
//! core.  Anything that maps a current to an irradiance qualifies, including
//! a plain closure.

/// Current (A) → irradiance (W/cm²).
pub trait Calibration: Send + Sync {
    /// `None` when `amps` is outside the calibrated range.
    fn current_to_irradiance(&self, amps: f64) -> Option<f64>;
}

impl<F> Calibration for F
where
    F: Fn(f64) -> Option<f64> + Send + Sync,
{
    fn current_to_irradiance(&self, amps: f64) -> Option<f64> {
        self(amps)
    }
}

/// Linear responsivity model `irradiance = |I| / responsivity`.
#[derive(Debug, Clone, Copy)]
pub struct LinearCalibration {
    /// Amperes per W/cm².
    pub responsivity: f64,
    /// Largest current the model is trusted for.
    pub max_current: f64,
}

impl Calibration for LinearCalibration {
    fn current_to_irradiance(&self, amps: f64) -> Option<f64> {
        let amps = amps.abs();
        if self.responsivity <= 0.0 || amps > self.max_current {
            return None;
        }
        Some(amps / self.responsivity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_calibrations() {
        let cal = |amps: f64| Some(amps * 2.0);
        assert_eq!(cal.current_to_irradiance(0.5), Some(1.0));
    }

    #[test]
    fn linear_model_rejects_out_of_range() {
        let cal = LinearCalibration {
            responsivity: 0.5,
            max_current: 1e-2,
        };
        assert_eq!(cal.current_to_irradiance(-1e-3), Some(2e-3));
        assert_eq!(cal.current_to_irradiance(1.0), None);
    }
}
