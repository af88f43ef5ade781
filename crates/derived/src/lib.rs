//! Lookout derived views: pure functions from kind snapshots to read models.

#![forbid(unsafe_code)]

pub mod index;
pub mod usergroup;

pub use index::PodsByNode;
pub use usergroup::{
    synthesize, user_group_condition, BindingRef, GroupType, RoleRef, UserGroup,
    UserGroupSnapshot,
};
