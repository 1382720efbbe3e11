use polyscft_field::Real;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Geometric summary a boundary leaves in the process-wide registry so
/// later boundaries can run pairwise contact checks against it.
#[derive(Clone, Debug)]
pub enum BoundaryShape {
    Sphere { center: [i64; 3], radius: f64 },
    Slab { axis: usize, lo: f64, hi: f64 },
}

#[derive(Clone, Debug)]
pub struct BoundaryRecord {
    pub name: String,
    pub shape: BoundaryShape,
}

/// Engine-wide state that the original kept in process globals: the
/// two random streams, the polymer scale length, and the boundary
/// registry. Owned by the Domain and passed down explicitly.
pub struct EngineContext<R: Real> {
    global_rng: ChaCha8Rng,
    rank_rng: ChaCha8Rng,
    scale_length: Option<usize>,
    boundaries: Vec<BoundaryRecord>,
    _marker: core::marker::PhantomData<R>,
}

impl<R: Real> EngineContext<R> {
    pub fn new(seed: u64, rank: usize) -> Self {
        EngineContext {
            // The global stream must produce the same draws on every
            // rank; the rank stream is decorrelated by offset and is
            // only legal for local noise.
            global_rng: ChaCha8Rng::seed_from_u64(seed),
            rank_rng: ChaCha8Rng::seed_from_u64(seed ^ (0x9e37_79b9_7f4a_7c15 ^ rank as u64)),
            scale_length: None,
            boundaries: Vec::new(),
            _marker: core::marker::PhantomData,
        }
    }

    /// A globally synchronized uniform draw in `[0, 1)`.
    pub fn uniform_global(&mut self) -> R {
        R::sample(&mut self.global_rng)
    }

    /// A rank-local uniform draw in `[0, 1)`; permitted only for noise.
    pub fn uniform_rank(&mut self) -> R {
        R::sample(&mut self.rank_rng)
    }

    /// The chain scale length `N_ref`; set once from the first polymer.
    pub fn scale_length(&self) -> usize {
        self.scale_length
            .expect("scale length queried before any polymer was built")
    }

    pub fn scale_length_is_set(&self) -> bool {
        self.scale_length.is_some()
    }

    pub fn set_scale_length(&mut self, n: usize) {
        if self.scale_length.is_none() {
            self.scale_length = Some(n);
        }
    }

    pub fn register_boundary(&mut self, record: BoundaryRecord) {
        self.boundaries.push(record);
    }

    pub fn boundary_records(&self) -> &[BoundaryRecord] {
        &self.boundaries
    }
}
