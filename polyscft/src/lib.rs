#![allow(clippy::too_many_arguments)]
#![allow(clippy::needless_range_loop)]

//! A self-consistent field theory engine for polymer field simulations.
//!
//! The engine iterates a fixed-point problem: pseudo-spectral chain
//! propagators turn conjugate fields into monomer densities, and the
//! effective Hamiltonian's updaters turn densities back into fields,
//! until the two are self-consistent. Objects form a named tree rooted
//! at the [`domain::Domain`], wired by name resolution in a two-phase
//! build.

pub use polyscft_field as field;

pub mod attribs;
pub mod boundary;
pub mod catalog;
pub mod comm;
pub mod context;
pub mod decomp;
pub mod domain;
pub mod effhamil;
pub mod error;
pub mod fftplan;
pub mod grid;
pub mod history;
pub mod interaction;
pub mod io;
pub mod physfield;
pub mod polymer;
pub mod solvent;
pub mod stfunc;
pub mod timing;
pub mod updater;
