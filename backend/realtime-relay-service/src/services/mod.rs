pub mod directory;
pub mod presence;
