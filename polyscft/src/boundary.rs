use anyhow::Result;
use hashbrown::HashMap;
use log::{debug, warn};
use polyscft_field::Real;

use crate::attribs::AttribSet;
use crate::context::{BoundaryRecord, BoundaryShape, EngineContext};
use crate::decomp::SlabDecomp;
use crate::error::{class_error, ErrorClass};
use crate::grid::UniCartGrid;
use crate::physfield::{PhysField, PhysFieldId};
use crate::stfunc::StFunc;

/// Imprint values below this are not stored as boundary points.
const IMPRINT_THRESHOLD: f64 = 1e-8;

/// The closed set of boundary kinds.
#[derive(Clone, Debug)]
pub enum BoundaryKind<R: Real> {
    /// A static wall slab with tanh edges.
    FixedWall { profile: StFunc<R> },
    /// A static sphere with a smooth surface shell.
    InteractingSphere {
        center: [i64; 3],
        radius: R,
        width: R,
    },
    /// A sphere that attempts a random unit displacement each step,
    /// rejected when it would contact another boundary.
    ProbeSphere {
        center: [i64; 3],
        radius: R,
        width: R,
    },
}

/// A typed spatial obstacle: a list of `(position, value)` imprint
/// pairs folded into the box, deposited into the constraint field's
/// wall density.
pub struct Boundary<R: Real> {
    name: String,
    path: String,
    kind: BoundaryKind<R>,
    field_name: String,
    field: Option<PhysFieldId>,
    points: Vec<([i64; 3], R)>,
}

impl<R: Real> Boundary<R> {
    pub fn from_attribs(name: &str, tas: &AttribSet) -> Result<Self> {
        let read_center = |tas: &AttribSet| -> Result<[i64; 3]> {
            let v = tas.get_opt_vec("center")?;
            let mut c = [0i64; 3];
            for (d, &x) in v.iter().take(3).enumerate() {
                c[d] = x;
            }
            Ok(c)
        };

        let kind = match tas.kind()?.as_str() {
            "fixedWall" => {
                let axis = tas.option_or("axis", 0)? as usize;
                if axis > 2 {
                    return Err(class_error(
                        ErrorClass::InvalidAttribute,
                        tas.path(),
                        format!("axis {axis} out of range"),
                    ));
                }
                BoundaryKind::FixedWall {
                    profile: StFunc::TanhSlab {
                        axis,
                        lo: R::from_f64(tas.get_param("leftEdge")?),
                        hi: R::from_f64(tas.get_param("rightEdge")?),
                        width: R::from_f64(tas.param_or("widthParam", 1.0)?),
                        amplitude: R::from_f64(tas.param_or("amplitude", 1.0)?),
                    },
                }
            }
            "interactingSphere" => BoundaryKind::InteractingSphere {
                center: read_center(tas)?,
                radius: R::from_f64(tas.get_param("radius")?),
                width: R::from_f64(tas.param_or("widthParam", 1.0)?),
            },
            "probeSphere" => BoundaryKind::ProbeSphere {
                center: read_center(tas)?,
                radius: R::from_f64(tas.get_param("radius")?),
                width: R::from_f64(tas.param_or("widthParam", 1.0)?),
            },
            other => {
                return Err(class_error(
                    ErrorClass::InvalidAttribute,
                    tas.path(),
                    format!("unknown Boundary kind {other:?}"),
                ))
            }
        };

        Ok(Boundary {
            name: name.to_string(),
            path: tas.path().to_string(),
            kind,
            field_name: tas.string_or("boundaryfield", "defaultPressure")?,
            field: None,
            points: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn points(&self) -> &[([i64; 3], R)] {
        &self.points
    }

    pub fn is_mobile(&self) -> bool {
        matches!(self.kind, BoundaryKind::ProbeSphere { .. })
    }

    fn shape_record(&self) -> BoundaryRecord {
        let shape = match &self.kind {
            BoundaryKind::FixedWall {
                profile: StFunc::TanhSlab { axis, lo, hi, .. },
            } => BoundaryShape::Slab {
                axis: *axis,
                lo: (*lo).to_f64(),
                hi: (*hi).to_f64(),
            },
            BoundaryKind::FixedWall { .. } => unreachable!("walls are tanh slabs"),
            BoundaryKind::InteractingSphere { center, radius, .. }
            | BoundaryKind::ProbeSphere { center, radius, .. } => BoundaryShape::Sphere {
                center: *center,
                radius: (*radius).to_f64(),
            },
        };
        BoundaryRecord {
            name: self.name.clone(),
            shape,
        }
    }

    /// Pairwise contact predicate against a registered shape.
    pub fn in_contact(&self, other: &BoundaryRecord, grid: &UniCartGrid<R>) -> bool {
        let mine = self.shape_record();
        shapes_in_contact(&mine.shape, &other.shape, grid)
    }

    /// Resolves the target field, computes the imprint list, deposits
    /// it, and registers this boundary for later contact checks.
    pub fn build_solvers(
        &mut self,
        grid: &UniCartGrid<R>,
        decomp: &SlabDecomp,
        phys: &mut [PhysField<R>],
        phys_names: &HashMap<String, PhysFieldId>,
        ctx: &mut EngineContext<R>,
    ) -> Result<()> {
        let &id = phys_names.get(&self.field_name).ok_or_else(|| {
            class_error(
                ErrorClass::UnknownObject,
                &self.path,
                format!("no PhysField named {:?}", self.field_name),
            )
        })?;
        if phys[id.0].wall_dens().is_none() {
            return Err(class_error(
                ErrorClass::InvalidAttribute,
                &self.path,
                format!("field {:?} is not a constraint field", self.field_name),
            ));
        }
        self.field = Some(id);

        for record in ctx.boundary_records() {
            if self.in_contact(record, grid) {
                warn!(
                    "boundary {} is in contact with {} at build",
                    self.name, record.name
                );
            }
        }

        self.points = self.compute_points(grid);
        self.apply_imprint(grid, decomp, phys, R::ONE);
        ctx.register_boundary(self.shape_record());
        debug!("boundary {}: {} imprint points", self.name, self.points.len());
        Ok(())
    }

    /// Mobile boundaries attempt one synchronized random unit move per
    /// step; contact with any other registered boundary rejects it.
    pub fn update(
        &mut self,
        grid: &UniCartGrid<R>,
        decomp: &SlabDecomp,
        phys: &mut [PhysField<R>],
        ctx: &mut EngineContext<R>,
    ) -> Result<()> {
        if !self.is_mobile() {
            return Ok(());
        }

        // The displacement comes from the global stream so every rank
        // proposes the same move.
        let mut delta = [0i64; 3];
        for d in delta.iter_mut().take(grid.ndim()) {
            let u: R = ctx.uniform_global();
            *d = (u.to_f64() * 3.0).floor() as i64 - 1;
        }

        let BoundaryKind::ProbeSphere { center, .. } = &self.kind else {
            return Ok(());
        };
        let old_center = *center;
        let new_center = grid.fold([
            old_center[0] + delta[0],
            old_center[1] + delta[1],
            old_center[2] + delta[2],
        ]);

        let trial = {
            let mut b = Boundary {
                name: self.name.clone(),
                path: self.path.clone(),
                kind: self.kind.clone(),
                field_name: self.field_name.clone(),
                field: self.field,
                points: Vec::new(),
            };
            if let BoundaryKind::ProbeSphere { center, .. } = &mut b.kind {
                *center = new_center;
            }
            b
        };
        let blocked = ctx
            .boundary_records()
            .iter()
            .filter(|r| r.name != self.name)
            .any(|r| trial.in_contact(r, grid));
        if blocked {
            debug!("probe sphere {}: move rejected by contact", self.name);
            return Ok(());
        }

        // Move: erase the old imprint, stamp the new one.
        self.apply_imprint(grid, decomp, phys, R::NEG_ONE);
        if let BoundaryKind::ProbeSphere { center, .. } = &mut self.kind {
            *center = new_center;
        }
        self.points = self.compute_points(grid);
        self.apply_imprint(grid, decomp, phys, R::ONE);
        Ok(())
    }

    fn compute_points(&self, grid: &UniCartGrid<R>) -> Vec<([i64; 3], R)> {
        let n = grid.num_cells_global();
        let mut points = Vec::new();
        match &self.kind {
            BoundaryKind::FixedWall { profile } => {
                for ix in 0..n[0] {
                    for iy in 0..n[1] {
                        for iz in 0..n[2] {
                            let x = [
                                R::from_usize(ix),
                                R::from_usize(iy),
                                R::from_usize(iz),
                            ];
                            let v = profile.eval(x, R::ZERO);
                            if v.to_f64() > IMPRINT_THRESHOLD {
                                points.push((
                                    grid.fold([ix as i64, iy as i64, iz as i64]),
                                    v,
                                ));
                            }
                        }
                    }
                }
            }
            BoundaryKind::InteractingSphere {
                center,
                radius,
                width,
            }
            | BoundaryKind::ProbeSphere {
                center,
                radius,
                width,
            } => {
                // Smooth sphere: ½(1 − tanh((d − R)/w)); only cells
                // within the shell margin are visited, each exactly
                // once even when the shell wraps a short axis.
                let reach = ((*radius).to_f64() + 6.0 * (*width).to_f64()).ceil() as i64;
                let axis_coords = |d: usize| -> Vec<i64> {
                    let nd = n[d] as i64;
                    if 2 * reach + 1 >= nd {
                        (0..nd).collect()
                    } else {
                        (center[d] - reach..=center[d] + reach).collect()
                    }
                };
                for &px in &axis_coords(0) {
                    for &py in &axis_coords(1) {
                        for &pz in &axis_coords(2) {
                            let folded = grid.fold([px, py, pz]);
                            let d = grid.shortest_distance(folded, *center);
                            let v = R::HALF * (R::ONE - ((d - *radius) / *width).tanh());
                            if v.to_f64() > IMPRINT_THRESHOLD {
                                points.push((folded, v));
                            }
                        }
                    }
                }
            }
        }
        points
    }

    fn apply_imprint(
        &self,
        grid: &UniCartGrid<R>,
        decomp: &SlabDecomp,
        phys: &mut [PhysField<R>],
        sign: R,
    ) {
        let id = self.field.expect("boundary used before build_solvers");
        let wall = phys[id.0].wall_dens_mut().expect("constraint wall buffer");
        for &(p, v) in &self.points {
            if decomp.has_position(p) {
                let l = grid.to_local(p, decomp);
                let at = [l[0] as usize, l[1] as usize, l[2] as usize];
                let cur = wall.at(at);
                wall.set(at, cur + sign * v);
            }
        }
    }
}

fn shapes_in_contact<R: Real>(
    a: &BoundaryShape,
    b: &BoundaryShape,
    grid: &UniCartGrid<R>,
) -> bool {
    match (a, b) {
        (
            BoundaryShape::Sphere {
                center: c1,
                radius: r1,
            },
            BoundaryShape::Sphere {
                center: c2,
                radius: r2,
            },
        ) => grid.shortest_distance(*c1, *c2).to_f64() <= r1 + r2,
        (BoundaryShape::Sphere { center, radius }, BoundaryShape::Slab { axis, lo, hi })
        | (BoundaryShape::Slab { axis, lo, hi }, BoundaryShape::Sphere { center, radius }) => {
            let x = center[*axis] as f64;
            x >= lo - radius && x <= hi + radius
        }
        (
            BoundaryShape::Slab {
                axis: a1,
                lo: l1,
                hi: h1,
            },
            BoundaryShape::Slab {
                axis: a2,
                lo: l2,
                hi: h2,
            },
        ) => {
            // Slabs span the box on their other axes; distinct axes
            // always intersect.
            a1 != a2 || (l1 <= h2 && l2 <= h1)
        }
    }
}
