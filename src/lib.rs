//! # ALE subtraction analysis
//!
//! Voxel-wise comparison of two coordinate-based meta-analytic datasets. Each
//! study's foci are smoothed into a modelled-activation map, the maps of each
//! group are combined into a convergence map, and the difference between the
//! two groups is tested against a null built by randomly reassigning studies
//! between groups.
//!
//! ```no_run
//! use ale_subtraction::{run_subtraction, Dataset, Group, KernelConfig, MapKind};
//!
//! let a = Dataset::from_json_file("group1.json", Group::A)?;
//! let b = Dataset::from_json_file("group2.json", Group::B)?;
//! let result = run_subtraction(&a, &b, &KernelConfig::default(), 10_000, Some(42))?;
//! let z = result.map(MapKind::ZStatistic);
//! # Ok::<(), ale_subtraction::SubtractionError>(())
//! ```
//!
//! Modules, leaves first:
//!
//! * [`grid`], [`dataset`], [`loader`] – spatial metadata, studies, JSON input
//! * [`kernel`], [`estimator`] – per-study maps and group aggregation
//! * [`difference`], [`permutation`], [`null`] – observed map and null
//! * [`significance`], [`math`] – p and z
//! * [`result`], [`subtraction`] – output container and pipeline

pub mod dataset;
pub mod difference;
pub mod error;
pub mod estimator;
pub mod grid;
pub mod kernel;
pub mod loader;
pub mod math;
pub mod null;
pub mod permutation;
pub mod result;
pub mod significance;
pub mod subtraction;

pub use dataset::{CoordinateSpace, Dataset, Group, Study};
pub use error::{Result, SubtractionError};
pub use estimator::{Aggregation, Aggregator};
pub use grid::Grid;
pub use kernel::{AleKernel, KernelConfig, KernelTransformer, MkdaKernel};
pub use null::{NullDistribution, NullRepresentation};
pub use permutation::{Partition, PartitionSource, PartitionStrategy};
pub use result::{MapKind, Peak, RunMetadata, SubtractionResult, VoxelImage};
pub use subtraction::{run_subtraction, Subtraction, SubtractionConfig};
