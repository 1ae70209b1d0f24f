//! Provider-neutral resource model

mod expiry;
mod features;
mod node;
mod resource;

pub use expiry::{Expiry, ZERO_EXPIRY, parse_duration};
pub use features::Features;
pub use node::{
    Arch, Group, GroupId, GroupKind, GroupName, MAX_GROUP_NAME_LEN, Node, NodeInstance, NodeNo,
    NodeState,
};
pub use resource::{
    CLIENT_TEMPLATE_VERSION, ExpirySystemRecord, ExpirySystemSpec, FirewallDetail, FirewallRule,
    FirewallSpec, Subnet, Template, TemplateKey, TemplateSpec, Volume, VolumeSpec,
};
