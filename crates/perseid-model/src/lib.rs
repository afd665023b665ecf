//! Distribution-propagation model layer.
//!
//! Bridges the dataflow IR and the polynomial-chaos algebra: the
//! topological propagation engine, the quantization-noise registry and
//! splicing, the adaptive ME-gPC domain partitioner, and the hierarchical
//! Fiduccia–Mattheyses grouping of noise sources.

pub mod groups;
pub mod linalg;
pub mod megpc;
pub mod noise;
pub mod propagate;

pub use groups::partition_groups;
pub use megpc::{
    DomainPartitioner, ForkPartition, MegpcParams, PartitionError, RefinedSubdomain, Subdomain,
};
pub use noise::{
    amplitude_distribution, eligible_nodes, quantizer_amplitude, splice_noise, NoiseRegistry,
};
pub use propagate::{propagate, PropagateError};
