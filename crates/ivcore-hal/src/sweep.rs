//! Sweep point generation.
//!
//! Points are generated once, up front, then commanded one by one by the
//! registry.  The final point of every leg is pinned to the exact requested
//! endpoint so floating-point reconstruction never leaves the instrument a
//! hair short of (or past) the target.

use ivcore_types::{IvError, SweepDirection, SweepKind, SweepScale};
use serde::{Deserialize, Serialize};

/// Stand-in for a zero endpoint on a log scale.
pub const LOG_ZERO_EPSILON: f64 = 1e-9;

/// Largest point count accepted for one sweep leg or one list sweep.
pub const MAX_SWEEP_POINTS: usize = 100_000;

/// Shape of a staircase sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepShape {
    pub start: f64,
    pub stop: f64,
    pub points: usize,
    #[serde(default)]
    pub scale: SweepScale,
    #[serde(default)]
    pub direction: SweepDirection,
    #[serde(default)]
    pub kind: SweepKind,
}

impl SweepShape {
    pub fn linear(start: f64, stop: f64, points: usize) -> Self {
        Self {
            start,
            stop,
            points,
            scale: SweepScale::Linear,
            direction: SweepDirection::Forward,
            kind: SweepKind::Single,
        }
    }
}

/// Expand a [`SweepShape`] into the commanded values, in order.
///
/// * `Backward` swaps start and stop before generation.
/// * `Log` replaces a zero endpoint with ±[`LOG_ZERO_EPSILON`] carrying the
///   sign of the other endpoint.
/// * `Double` appends the forward leg reversed without its first element
///   (so the turnaround is not repeated) and pins the last point to the
///   forward leg's start.  `N` forward points give `2N − 1` in total.
///
/// # Errors
///
/// [`IvError::InvalidArgument`] for zero points, more than
/// [`MAX_SWEEP_POINTS`], non-finite endpoints, or a log sweep whose
/// endpoints have opposite signs.
pub fn generate_points(shape: &SweepShape) -> Result<Vec<f64>, IvError> {
    if shape.points == 0 {
        return Err(IvError::InvalidArgument("sweep needs at least one point".into()));
    }
    if shape.points > MAX_SWEEP_POINTS {
        return Err(IvError::InvalidArgument(format!(
            "sweep of {} points exceeds the limit of {MAX_SWEEP_POINTS}",
            shape.points
        )));
    }
    if !(shape.start.is_finite() && shape.stop.is_finite()) {
        return Err(IvError::InvalidArgument(format!(
            "sweep endpoints must be finite (start={}, stop={})",
            shape.start, shape.stop
        )));
    }

    let (start, stop) = match shape.direction {
        SweepDirection::Forward => (shape.start, shape.stop),
        SweepDirection::Backward => (shape.stop, shape.start),
    };

    let forward = match shape.scale {
        SweepScale::Linear => linear(start, stop, shape.points),
        SweepScale::Log => log(start, stop, shape.points)?,
    };

    Ok(match shape.kind {
        SweepKind::Single => forward,
        SweepKind::Double => {
            let origin = forward[0];
            let mut all = forward.clone();
            all.extend(forward.iter().rev().skip(1));
            if let Some(last) = all.last_mut() {
                *last = origin;
            }
            all
        }
    })
}

fn linear(start: f64, stop: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let span = stop - start;
    let denom = (n - 1) as f64;
    let mut pts: Vec<f64> = (0..n).map(|i| start + span * (i as f64) / denom).collect();
    pts[n - 1] = stop;
    pts
}

fn log(start: f64, stop: f64, n: usize) -> Result<Vec<f64>, IvError> {
    let (start, stop) = match (start == 0.0, stop == 0.0) {
        (true, true) => {
            return Err(IvError::InvalidArgument(
                "log sweep cannot have both endpoints at zero".into(),
            ));
        }
        (true, false) => (LOG_ZERO_EPSILON.copysign(stop), stop),
        (false, true) => (start, LOG_ZERO_EPSILON.copysign(start)),
        (false, false) => (start, stop),
    };
    if start.signum() != stop.signum() {
        return Err(IvError::InvalidArgument(format!(
            "log sweep endpoints must share a sign (start={start}, stop={stop})"
        )));
    }
    if n == 1 {
        return Ok(vec![start]);
    }

    let sign = start.signum();
    let (a, b) = (start.abs().log10(), stop.abs().log10());
    let denom = (n - 1) as f64;
    let mut pts: Vec<f64> = (0..n)
        .map(|i| sign * 10f64.powf(a + (b - a) * (i as f64) / denom))
        .collect();
    pts[0] = start;
    pts[n - 1] = stop;
    Ok(pts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_scenario_is_exact() {
        let pts = generate_points(&SweepShape::linear(0.0, 2.0, 5)).unwrap();
        assert_eq!(pts, vec![0.0, 0.5, 1.0, 1.5, 2.0]);
    }

    #[test]
    fn last_point_equals_endpoint_exactly() {
        let cases = [
            (0.1, 0.7, 7),
            (-1.3, 2.9, 13),
            (1e-3, 3.3e-1, 101),
            (0.0, -0.3, 3),
            (5.0, 5.0, 4),
        ];
        for (start, stop, n) in cases {
            let pts = generate_points(&SweepShape::linear(start, stop, n)).unwrap();
            assert_eq!(pts.len(), n);
            assert_eq!(pts[0], start);
            assert_eq!(pts[n - 1], stop, "start={start} stop={stop} n={n}");
        }
    }

    #[test]
    fn point_count_is_capped() {
        let at_limit = generate_points(&SweepShape::linear(0.0, 1.0, MAX_SWEEP_POINTS)).unwrap();
        assert_eq!(at_limit.len(), MAX_SWEEP_POINTS);

        let err = generate_points(&SweepShape::linear(0.0, 1.0, usize::MAX)).unwrap_err();
        assert!(matches!(err, IvError::InvalidArgument(_)));
        assert!(err.to_string().contains("exceeds the limit"), "{err}");
    }

    #[test]
    fn backward_swaps_endpoints() {
        let mut shape = SweepShape::linear(0.0, 1.0, 3);
        shape.direction = SweepDirection::Backward;
        assert_eq!(generate_points(&shape).unwrap(), vec![1.0, 0.5, 0.0]);
    }

    #[test]
    fn double_sweep_has_symmetric_return_leg() {
        let n = 6;
        let mut shape = SweepShape::linear(-0.2, 1.1, n);
        shape.kind = SweepKind::Double;
        let pts = generate_points(&shape).unwrap();
        assert_eq!(pts.len(), 2 * n - 1);
        assert_eq!(pts[n - 1], 1.1);
        assert_eq!(pts[2 * n - 2], -0.2);
        for i in 0..n {
            assert_eq!(pts[i], pts[2 * n - 2 - i]);
        }
    }

    #[test]
    fn log_substitutes_signed_epsilon_for_zero() {
        let mut shape = SweepShape::linear(0.0, 1.0, 10);
        shape.scale = SweepScale::Log;
        let pts = generate_points(&shape).unwrap();
        assert_eq!(pts[0], LOG_ZERO_EPSILON);
        assert_eq!(pts[9], 1.0);
        assert!(pts.windows(2).all(|w| w[1] > w[0]));

        shape.start = -1.0;
        shape.stop = 0.0;
        let pts = generate_points(&shape).unwrap();
        assert_eq!(pts[0], -1.0);
        assert_eq!(pts[9], -LOG_ZERO_EPSILON);
    }

    #[test]
    fn log_decades_are_evenly_spaced() {
        let mut shape = SweepShape::linear(1e-3, 1.0, 4);
        shape.scale = SweepScale::Log;
        let pts = generate_points(&shape).unwrap();
        assert!((pts[1] - 1e-2).abs() < 1e-15);
        assert!((pts[2] - 1e-1).abs() < 1e-14);
        assert_eq!(pts[3], 1.0);
    }

    #[test]
    fn log_across_zero_is_rejected() {
        let mut shape = SweepShape::linear(-1.0, 1.0, 5);
        shape.scale = SweepScale::Log;
        assert!(matches!(
            generate_points(&shape),
            Err(IvError::InvalidArgument(_))
        ));
    }

    #[test]
    fn degenerate_counts() {
        assert!(generate_points(&SweepShape::linear(0.0, 1.0, 0)).is_err());
        assert_eq!(
            generate_points(&SweepShape::linear(0.3, 1.0, 1)).unwrap(),
            vec![0.3]
        );
        let mut shape = SweepShape::linear(0.3, 1.0, 1);
        shape.kind = SweepKind::Double;
        assert_eq!(generate_points(&shape).unwrap(), vec![0.3]);
    }
}
