//! Graph-construction knobs carried by every buffer node.
//!
//! Origin constructors (`from_host`, `loadop`, `constant`) take a [`LazyConfig`]; every node
//! derived from them inherits the config of its receiver. Nothing reads process-wide state unless
//! the caller opts in through [`LazyConfig::from_env`].

use crate::env;

/// How aggressively adjacent operations are merged into one kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FusionLevel {
    /// Every operation is its own kernel.
    None,
    /// Elementwise chains collapse into one tree, and an elementwise producer is folded into the
    /// reduce that consumes it.
    ElementwiseMerge,
    /// Additionally, one reduce may be folded into the elementwise op that consumes it.
    #[default]
    ElementwiseAndOneReduceMerge,
}

impl FusionLevel {
    /// Maps the numeric levels 0, 1 and 2; anything above 2 is the strongest level.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => FusionLevel::None,
            1 => FusionLevel::ElementwiseMerge,
            _ => FusionLevel::ElementwiseAndOneReduceMerge,
        }
    }

    pub fn merges_elementwise(self) -> bool {
        !matches!(self, FusionLevel::None)
    }

    pub fn merges_one_reduce(self) -> bool {
        matches!(self, FusionLevel::ElementwiseAndOneReduceMerge)
    }
}

/// Thresholds of the two-pass reduce split performed by `LazyBuffer::r`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitReducePolicy {
    /// Minimum number of input elements folded into each output element.
    pub min_work: usize,
    /// Minimum `gcd(256, extent)` of the axis chosen for splitting.
    pub min_divisor: usize,
    /// Minimum `divisor / stride` score of the chosen axis.
    pub min_score: f64,
}

impl SplitReducePolicy {
    /// A policy that never splits.
    pub fn disabled() -> Self {
        SplitReducePolicy {
            min_work: usize::MAX,
            ..Self::default()
        }
    }
}

impl Default for SplitReducePolicy {
    fn default() -> Self {
        SplitReducePolicy {
            min_work: 32768,
            min_divisor: 16,
            min_score: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LazyConfig {
    pub fusion: FusionLevel,
    pub split: SplitReducePolicy,
}

impl LazyConfig {
    /// Reads the fusion level from `LAZYRS_OPT`. The variable is parsed once per process.
    pub fn from_env() -> Self {
        LazyConfig {
            fusion: FusionLevel::from_level(env::opt_level()),
            ..Self::default()
        }
    }

    pub fn with_fusion(mut self, fusion: FusionLevel) -> Self {
        self.fusion = fusion;
        self
    }

    pub fn with_split(mut self, split: SplitReducePolicy) -> Self {
        self.split = split;
        self
    }
}
