//! Sandbox lifecycle: policy, creation, output relay, input, and teardown.

pub mod policy;
pub mod provisioner;
pub mod relay;
pub mod stdin;
pub mod teardown;

pub use policy::{CpuAllocator, FixedCpuAllocator, HostCpuAllocator, ResourcePolicy};
pub use provisioner::{Provisioner, SandboxHandle};
pub use relay::{RelaySummary, StreamRelay};
pub use stdin::StdinChannel;
pub use teardown::{Teardown, TeardownOutcome};
