use anyhow::Result;

use crate::error::{class_error, ErrorClass};

/// One entry of the object catalog: an input-tree type tag, the kind
/// strings its factory accepts, and a help line for the CLI.
pub struct ObjectType {
    pub tag: &'static str,
    pub kinds: &'static [&'static str],
    pub help: &'static str,
}

/// The object catalog, in build order.
///
/// This is the explicit replacement for registration at static-init
/// time: the table is consulted by the Domain build and by the CLI
/// help, and its order is the construction order of the holders.
pub const OBJECT_CATALOG: &[ObjectType] = &[
    ObjectType {
        tag: "Grid",
        kinds: &["uniCartGrid"],
        help: "Uniform Cartesian lattice: numCellsGlobal (powers of two), cellSizes.",
    },
    ObjectType {
        tag: "Decomp",
        kinds: &["regular", "fftw"],
        help: "Slab decomposition of the box; transposeFlag partitions y in k-space.",
    },
    ObjectType {
        tag: "Comm",
        kinds: &["mpiComm"],
        help: "Collective communicator; reductions, broadcasts, barriers.",
    },
    ObjectType {
        tag: "FFT",
        kinds: &["normalfftw", "transposefftw"],
        help: "Real-to-real transform plan over the slab layout.",
    },
    ObjectType {
        tag: "PhysField",
        kinds: &["monomerDens", "chargeDens", "constraint"],
        help: "Density + conjugate field pair; initcond, initScale, maxDensThreshold.",
    },
    ObjectType {
        tag: "Polymer",
        kinds: &["blockCopolymer", "polyDisperseBCP"],
        help: "Chain species: volfrac, length, Block children; pdi/numQuadPoints for \
               polydisperse chains.",
    },
    ObjectType {
        tag: "Block",
        kinds: &["flexPseudoSpec", "chargeFlexPseudoSpec", "semiflexibleBlock"],
        help: "Chain segment: scfield, length, ds, bSegRatio, headjoined/tailjoined.",
    },
    ObjectType {
        tag: "Solvent",
        kinds: &["simpleSolvent", "simpleIons"],
        help: "Single-segment species: volfrac, scfield, size; valence for ions.",
    },
    ObjectType {
        tag: "Boundary",
        kinds: &["fixedWall", "interactingSphere", "probeSphere"],
        help: "Obstacles imprinting the constraint field; edges or center/radius.",
    },
    ObjectType {
        tag: "EffHamil",
        kinds: &["canonicalMF"],
        help: "One SCFT step: Interaction and Updater children in declared order.",
    },
    ObjectType {
        tag: "Interaction",
        kinds: &["flory", "floryWall"],
        help: "Energy functional term: scfields, chiN (scalar or STFunc child).",
    },
    ObjectType {
        tag: "Updater",
        kinds: &[
            "steepestDescent",
            "simpleSpecFilter",
            "multiSpecFilter",
            "poissonUpdater",
        ],
        help: "Conjugate-field update rule: updateFields, applyStart/Frequency/End.",
    },
    ObjectType {
        tag: "History",
        kinds: &["freeEnergy", "floryConstChi", "floryChiAtPoint"],
        help: "Time-series diagnostic: updatePeriodicity plus kind-specific refs.",
    },
];

/// Help text for one object type, or the whole catalog for `None`.
pub fn help_text(tag: Option<&str>) -> Option<String> {
    match tag {
        Some(tag) => OBJECT_CATALOG
            .iter()
            .find(|o| o.tag.eq_ignore_ascii_case(tag))
            .map(|o| format!("{}\n  kinds: {}\n  {}", o.tag, o.kinds.join(", "), o.help)),
        None => Some(
            OBJECT_CATALOG
                .iter()
                .map(|o| format!("{:<12} {}", o.tag, o.kinds.join(", ")))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
    }
}

/// Validates a child's kind selector against the catalog.
pub fn validate_kind(tag: &str, kind: &str, path: &str) -> Result<()> {
    let entry = OBJECT_CATALOG.iter().find(|o| o.tag == tag).ok_or_else(|| {
        class_error(
            ErrorClass::InvalidAttribute,
            path,
            format!("unknown object type {tag:?}"),
        )
    })?;
    if !entry.kinds.contains(&kind) {
        return Err(class_error(
            ErrorClass::InvalidAttribute,
            path,
            format!("unknown {tag} kind {kind:?}"),
        ));
    }
    Ok(())
}
