pub mod cleanup;
pub mod cp;
pub mod get;
pub mod ls;
pub mod put;
pub mod remote;
pub mod rm;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Command {
    /// Manage named remotes
    Remote(remote::RemoteArgs),
    /// List parts on a remote
    Ls(ls::LsArgs),
    /// Upload a local file as a part
    Put(put::PutArgs),
    /// Download a part to a local file
    Get(get::GetArgs),
    /// Copy parts between remotes
    Cp(cp::CpArgs),
    /// Delete parts from a remote
    Rm(rm::RmArgs),
    /// Remove empty directories left behind by deletes
    Cleanup(cleanup::CleanupArgs),
}
