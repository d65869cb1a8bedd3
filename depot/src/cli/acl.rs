use clap::{Args, Subcommand};
use colored::Colorize;
use depot_common::config::Config;
use depot_common::error::Result;
use depot_common::model::{AclAction, AclChange};
use depot_net::api::{RemoteClient, RemoteRepository};

#[derive(Args, Debug)]
pub struct AclArgs {
    #[command(subcommand)]
    pub command: AclCommand,
}

#[derive(Subcommand, Debug)]
pub enum AclCommand {
    /// Show the ACLs affecting a package path
    Get {
        package_path: String,
    },
    /// Grant a role to a principal on a package path
    Grant {
        package_path: String,
        role: String,
        principal: String,
    },
    /// Revoke a role from a principal on a package path
    Revoke {
        package_path: String,
        role: String,
        principal: String,
    },
}

impl AclArgs {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let remote = RemoteClient::new(config)?;
        match &self.command {
            AclCommand::Get { package_path } => {
                let acls = remote.fetch_acl(package_path).await?;
                if acls.is_empty() {
                    println!("{}", "No ACLs defined".yellow());
                    return Ok(());
                }
                for acl in &acls {
                    println!("{} on {}:", acl.role.bold(), acl.package_path);
                    for principal in &acl.principals {
                        println!("  {principal}");
                    }
                    if !acl.modified_by.is_empty() {
                        println!("  modified by {} at {}", acl.modified_by, acl.modified_ts);
                    }
                }
            }
            AclCommand::Grant {
                package_path,
                role,
                principal,
            } => {
                let change = AclChange {
                    action: AclAction::Grant,
                    role: role.clone(),
                    principal: principal.clone(),
                };
                remote.modify_acl(package_path, &[change]).await?;
                println!("Granted {} to {} on {}", role.bold(), principal, package_path);
            }
            AclCommand::Revoke {
                package_path,
                role,
                principal,
            } => {
                let change = AclChange {
                    action: AclAction::Revoke,
                    role: role.clone(),
                    principal: principal.clone(),
                };
                remote.modify_acl(package_path, &[change]).await?;
                println!(
                    "Revoked {} from {} on {}",
                    role.bold(),
                    principal,
                    package_path
                );
            }
        }
        Ok(())
    }
}
