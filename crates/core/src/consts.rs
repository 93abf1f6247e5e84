//! Well-known file names and limits.

/// The description file that defines a package.
pub const PKG_FILE_NAME: &str = "PKG.lua";

/// The workspace configuration file at a workspace (or extension) root.
pub const WORKSPACE_FILE_NAME: &str = "workspace.lua";

/// Upper bound on the workspace configuration `extends` chain.
pub const MAX_CONFIG_CHAIN: u32 = 32;
