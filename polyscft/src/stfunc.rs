use anyhow::Result;
use polyscft_field::Real;

use crate::attribs::AttribSet;
use crate::error::{class_error, ErrorClass};

/// Built-in space-time functions.
///
/// Embedded script evaluation is an external collaborator; this closed
/// set covers the profiles the engine itself needs — constant values,
/// linear parameter ramps in time, and the tanh slab used for wall
/// shapes and spatially structured χN fields. Spatial coordinates are
/// global grid indices.
#[derive(Clone, Debug)]
pub enum StFunc<R: Real> {
    Constant {
        value: R,
    },
    /// `value(t) = start + rate·t`, clamped at `stop` when given.
    LinearRamp {
        start: R,
        rate: R,
        stop: Option<R>,
    },
    /// A smooth slab on one axis: `amp·½·(tanh((x−lo)/w) − tanh((x−hi)/w))`.
    TanhSlab {
        axis: usize,
        lo: R,
        hi: R,
        width: R,
        amplitude: R,
    },
}

impl<R: Real> StFunc<R> {
    pub fn from_attribs(tas: &AttribSet) -> Result<Self> {
        match tas.kind()?.as_str() {
            "constant" => Ok(StFunc::Constant {
                value: R::from_f64(tas.get_param("value")?),
            }),
            "linearRamp" => Ok(StFunc::LinearRamp {
                start: R::from_f64(tas.get_param("startValue")?),
                rate: R::from_f64(tas.get_param("rate")?),
                stop: if tas.has_param("stopValue") {
                    Some(R::from_f64(tas.get_param("stopValue")?))
                } else {
                    None
                },
            }),
            "movTanhSlab" => {
                let axis = tas.option_or("axis", 0)? as usize;
                if axis > 2 {
                    return Err(class_error(
                        ErrorClass::InvalidAttribute,
                        tas.path(),
                        format!("axis {axis} out of range"),
                    ));
                }
                Ok(StFunc::TanhSlab {
                    axis,
                    lo: R::from_f64(tas.get_param("leftEdge")?),
                    hi: R::from_f64(tas.get_param("rightEdge")?),
                    width: R::from_f64(tas.param_or("widthParam", 1.0)?),
                    amplitude: R::from_f64(tas.param_or("amplitude", 1.0)?),
                })
            }
            other => Err(class_error(
                ErrorClass::InvalidAttribute,
                tas.path(),
                format!("unknown STFunc kind {other:?}"),
            )),
        }
    }

    pub fn eval(&self, x: [R; 3], t: R) -> R {
        match *self {
            StFunc::Constant { value } => value,
            StFunc::LinearRamp { start, rate, stop } => {
                let v = start + rate * t;
                match stop {
                    Some(s) if rate > R::ZERO => v.min(s),
                    Some(s) if rate < R::ZERO => v.max(s),
                    _ => v,
                }
            }
            StFunc::TanhSlab {
                axis,
                lo,
                hi,
                width,
                amplitude,
            } => {
                let u = x[axis];
                amplitude * R::HALF * (((u - lo) / width).tanh() - ((u - hi) / width).tanh())
            }
        }
    }

    /// Whether the value can vary in time.
    pub fn is_time_dependent(&self) -> bool {
        matches!(self, StFunc::LinearRamp { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> StFunc<f64> {
        let tas = AttribSet::from_json_str("STFunc", json).unwrap();
        StFunc::from_attribs(&tas).unwrap()
    }

    #[test]
    fn linear_ramp_clamps_at_stop() {
        let f = parse(
            r#"{ "kind": "linearRamp", "startValue": 10.0, "rate": 0.5, "stopValue": 12.0 }"#,
        );
        assert_eq!(f.eval([0.0; 3], 0.0), 10.0);
        assert_eq!(f.eval([0.0; 3], 2.0), 11.0);
        assert_eq!(f.eval([0.0; 3], 100.0), 12.0);
        assert!(f.is_time_dependent());
    }

    #[test]
    fn tanh_slab_is_near_one_inside_and_zero_outside() {
        let f = parse(
            r#"{ "kind": "movTanhSlab", "axis": 0, "leftEdge": 8.0, "rightEdge": 24.0, "widthParam": 0.5 }"#,
        );
        assert!(f.eval([16.0, 0.0, 0.0], 0.0) > 0.999);
        assert!(f.eval([0.0, 0.0, 0.0], 0.0) < 1e-6);
        assert!(f.eval([31.0, 0.0, 0.0], 0.0) < 1e-6);
        // Half-height at the edges.
        assert!((f.eval([8.0, 0.0, 0.0], 0.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn constant_ignores_space_and_time() {
        let f = parse(r#"{ "kind": "constant", "value": 15.0 }"#);
        assert_eq!(f.eval([3.0, 4.0, 5.0], 9.0), 15.0);
        assert!(!f.is_time_dependent());
    }
}
