#[cfg(feature = "timing")]
use std::time::Instant;

#[cfg(feature = "timing")]
use log::log;
use log::Level;

/// Wall-clock accounting for the phases of an outer SCFT step.
///
/// Scopes nest in stack order: `push` opens one, `pop` closes the
/// deepest open scope and logs how long it was open, indented by its
/// depth. The root scope opened at construction is closed by the final
/// `pop`, which reports the whole step. Without the `timing` feature
/// every operation is a no-op.
#[cfg(feature = "timing")]
pub struct TimingTree {
    level: Level,
    open: Vec<(String, Instant)>,
}

#[cfg(not(feature = "timing"))]
pub struct TimingTree;

impl TimingTree {
    #[cfg(feature = "timing")]
    pub fn new(root: &str, level: Level) -> Self {
        TimingTree {
            level,
            open: vec![(root.to_string(), Instant::now())],
        }
    }

    #[cfg(not(feature = "timing"))]
    pub fn new(_root: &str, _level: Level) -> Self {
        TimingTree
    }

    /// Opens a scope nested under the current one.
    #[cfg(feature = "timing")]
    pub fn push(&mut self, ctx: &str) {
        self.open.push((ctx.to_string(), Instant::now()));
    }

    #[cfg(not(feature = "timing"))]
    pub fn push(&mut self, _ctx: &str) {}

    /// Closes the deepest open scope and logs its duration.
    #[cfg(feature = "timing")]
    pub fn pop(&mut self) {
        let (name, entered) = self.open.pop().expect("pop without an open scope");
        let prefix = "| ".repeat(self.open.len());
        log!(
            self.level,
            "{}{:.4}s to {}",
            prefix,
            entered.elapsed().as_secs_f64(),
            name
        );
    }

    #[cfg(not(feature = "timing"))]
    pub fn pop(&mut self) {}
}

/// Times an expression as a named scope on the step's timing tree.
#[macro_export]
macro_rules! timed {
    ($timing_tree:expr, $ctx:expr, $exp:expr) => {{
        $timing_tree.push($ctx);
        let res = $exp;
        $timing_tree.pop();
        res
    }};
}
