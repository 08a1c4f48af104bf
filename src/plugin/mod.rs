/// Plugin side of the host
///
/// Everything that describes or talks to a pricing plugin: the registry of
/// descriptors, executable discovery, capability patterns, the wire protocol
/// and its framing, and the SDK plugin binaries are built on.
pub mod capability;
pub mod discovery;
pub mod framing;
pub mod protocol;
pub mod registry;
pub mod sdk;

// Re-export commonly used types
pub use capability::{CapabilityPattern, CapabilitySet, EffectiveCapabilities};
pub use registry::{PluginDescriptor, PluginRegistry, Tier};
pub use sdk::{PluginInfo, PricingPlugin};
