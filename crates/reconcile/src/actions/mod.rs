//! Built-in actions. The instance pipeline runs template, crds, resources
//! and conditions; the control plane pipeline runs delegate and mirror-status.

mod conditions;
mod control_plane;
mod crds;
mod resources;
mod template;

pub use conditions::{readiness, ConditionsAction};
pub use control_plane::{instance_type, DelegateAction, MirrorStatusAction};
pub use crds::ApplyCrdsAction;
pub use resources::ApplyResourcesAction;
pub use template::TemplateAction;
