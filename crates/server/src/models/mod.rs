//! Database models and CRUD operations.

pub mod folder;
pub mod folder_permission;
pub mod group;
pub mod image;
pub mod property;
pub mod user;

pub use folder::Folder;
pub use folder_permission::FolderPermission;
pub use group::Group;
pub use image::ImageRecord;
pub use user::User;
