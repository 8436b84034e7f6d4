use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "provisiond")]
#[command(about = "VM request approval and provisioning daemon")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the provisioning worker and sweeper until interrupted
    Serve,
    /// Create and act on resource requests
    #[command(subcommand)]
    Request(RequestCommand),
    /// Inspect and destroy provisioned resources
    #[command(subcommand)]
    Resource(ResourceCommand),
    /// Manage IP address pools
    #[command(subcommand)]
    Ip(IpCommand),
}

#[derive(Subcommand, Debug)]
pub enum RequestCommand {
    /// Submit a new request
    Create(CreateArgs),
    /// Show one request
    Show {
        id: String,
        /// Include the provisioning log
        #[arg(long)]
        log: bool,
    },
    /// List requests, newest first
    List {
        #[arg(long)]
        requester: Option<String>,
        /// pending, approved, rejected, provisioning, completed or failed
        #[arg(long)]
        status: Option<String>,
    },
    /// Approve a pending request; a running daemon picks it up
    Approve {
        id: String,
        #[arg(long)]
        approver: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Reject a pending request
    Reject {
        id: String,
        #[arg(long)]
        approver: String,
        #[arg(long)]
        reason: String,
    },
    /// Re-approve a failed request
    Retry { id: String },
    /// Delete a pending, rejected or failed request
    Delete { id: String },
    /// Show the generated configuration record
    Config { id: String },
}

#[derive(ClapArgs, Debug)]
pub struct CreateArgs {
    #[arg(long)]
    pub requester: String,
    #[arg(long)]
    pub provider: String,
    #[arg(long = "type", default_value = "vm")]
    pub resource_type: String,
    #[arg(long)]
    pub environment: String,
    /// VM spec as a JSON object, e.g. '{"name":"db1","cpu":2}'
    #[arg(long)]
    pub spec: String,
    #[arg(long)]
    pub quantity: Option<i64>,
    #[arg(long)]
    pub provider_id: Option<String>,
    #[arg(long)]
    pub module_id: Option<String>,
    #[arg(long)]
    pub credential_id: Option<String>,
    #[arg(long)]
    pub zone_id: Option<String>,
    #[arg(long)]
    pub region_id: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum ResourceCommand {
    /// List resources
    List {
        #[arg(long)]
        owner: Option<String>,
    },
    /// Show one resource
    Show { id: String },
    /// Tear a resource down now and wait for the result
    Destroy { id: String },
}

#[derive(Subcommand, Debug)]
pub enum IpCommand {
    /// Create an address pool
    CreatePool {
        #[arg(long)]
        name: String,
        /// Network in CIDR notation (e.g., "10.0.0.0/24")
        #[arg(long)]
        cidr: String,
        /// First usable address
        #[arg(long)]
        start: String,
        /// Last usable address
        #[arg(long)]
        end: String,
        #[arg(long)]
        gateway: Option<String>,
        #[arg(long)]
        zone_id: Option<String>,
    },
    /// List address pools
    Pools,
    /// List tracked addresses in a pool
    List { pool_id: String },
    /// Reserve the next free address
    Allocate {
        pool_id: String,
        #[arg(long)]
        hostname: Option<String>,
        #[arg(long)]
        resource_ref: Option<String>,
    },
    /// Reserve a chosen address
    AllocateSpecific {
        pool_id: String,
        address: String,
        #[arg(long)]
        hostname: Option<String>,
        #[arg(long)]
        resource_ref: Option<String>,
    },
    /// Return an address to its pool
    Release { allocation_id: String },
    /// Count free addresses in a pool
    Available { pool_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_approve() {
        let args = Args::try_parse_from([
            "provisiond",
            "request",
            "approve",
            "req-1",
            "--approver",
            "bob",
        ])
        .unwrap();

        match args.command {
            Command::Request(RequestCommand::Approve {
                id,
                approver,
                reason,
            }) => {
                assert_eq!(id, "req-1");
                assert_eq!(approver, "bob");
                assert!(reason.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_reject_requires_reason_flag() {
        let result = Args::try_parse_from([
            "provisiond",
            "request",
            "reject",
            "req-1",
            "--approver",
            "bob",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_ip_allocate_specific() {
        let args = Args::try_parse_from([
            "provisiond",
            "ip",
            "allocate-specific",
            "pool-1",
            "10.0.0.5",
            "--hostname",
            "db1",
        ])
        .unwrap();

        assert!(matches!(
            args.command,
            Command::Ip(IpCommand::AllocateSpecific { ref address, .. }) if address == "10.0.0.5"
        ));
    }

    #[test]
    fn test_create_defaults_type_to_vm() {
        let args = Args::try_parse_from([
            "provisiond",
            "request",
            "create",
            "--requester",
            "alice",
            "--provider",
            "pve",
            "--environment",
            "dev",
            "--spec",
            "{\"name\":\"db1\"}",
        ])
        .unwrap();

        let Command::Request(RequestCommand::Create(create)) = args.command else {
            panic!("expected request create");
        };
        assert_eq!(create.resource_type, "vm");
        assert!(create.quantity.is_none());
    }
}
