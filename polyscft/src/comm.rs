use anyhow::Result;
use polyscft_field::Real;

/// The collective seam between ranks.
///
/// MPI itself is an external collaborator; the engine is written
/// against this trait and every call site is a global synchronization
/// point that all ranks must reach with matching shapes.
pub trait Comm<R: Real> {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn barrier(&self);
    fn all_reduce_sum(&self, x: R) -> Result<R>;
    fn all_reduce_max(&self, x: R) -> Result<R>;
    fn all_reduce_sum_vec(&self, xs: &mut [R]) -> Result<()>;
}

/// Single-rank communicator: every reduction is the identity.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialComm;

impl<R: Real> Comm<R> for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn all_reduce_sum(&self, x: R) -> Result<R> {
        Ok(x)
    }

    fn all_reduce_max(&self, x: R) -> Result<R> {
        Ok(x)
    }

    fn all_reduce_sum_vec(&self, _xs: &mut [R]) -> Result<()> {
        Ok(())
    }
}
