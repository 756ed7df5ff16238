// build.rs

use clap::{Arg, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Common argument: daemon socket
fn socket_arg() -> Arg {
    Arg::new("socket")
        .short('s')
        .long("socket")
        .value_name("PATH")
        .help("Daemon socket path (default: /run/pkgworker/pkgworker.sock)")
}

fn flag(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .action(clap::ArgAction::SetTrue)
        .help(help)
}

/// Options shared by every transaction-creating command
fn transaction_args(cmd: Command) -> Command {
    cmd.arg(socket_arg())
        .arg(flag("allow-unauthenticated", "Accept packages without a valid signature"))
        .arg(
            Arg::new("yes")
                .short('y')
                .long("yes")
                .action(clap::ArgAction::SetTrue)
                .help("Answer every prompt with yes"),
        )
        .arg(Arg::new("proxy").long("proxy").help("HTTP proxy for downloads"))
        .arg(flag("no-wait", "Print the transaction id and return once it is queued"))
}

fn packages_arg() -> Arg {
    Arg::new("packages")
        .required(true)
        .num_args(1..)
        .help("Package names (`name` or `name,version`)")
}

fn build_cli() -> Command {
    Command::new("pkgworker")
        .version(env!("CARGO_PKG_VERSION"))
        .author("pkgworker Contributors")
        .about("Queued, observable package transactions run by a privileged daemon")
        .subcommand_required(true)
        .subcommand(
            Command::new("daemon")
                .about("Run the daemon")
                .arg(socket_arg())
                .arg(Arg::new("config").short('c').long("config").help("Configuration file"))
                .arg(
                    Arg::new("idle_timeout")
                        .long("idle-timeout")
                        .help("Exit after this long with nothing to do (e.g. \"10m\")"),
                )
                .arg(flag("no-polkit", "Grant every caller without asking PolicyKit")),
        )
        .subcommand(transaction_args(Command::new("update").about("Refresh package metadata")))
        .subcommand(transaction_args(
            Command::new("install").about("Install packages").arg(packages_arg()),
        ))
        .subcommand(transaction_args(
            Command::new("remove")
                .about("Remove packages")
                .arg(packages_arg())
                .arg(flag("purge", "Also remove configuration files")),
        ))
        .subcommand(transaction_args(
            Command::new("upgrade").about("Upgrade every installed package"),
        ))
        .subcommand(transaction_args(
            Command::new("install-file")
                .about("Install a local package file")
                .arg(Arg::new("path").required(true).help("Package file")),
        ))
        .subcommand(transaction_args(
            Command::new("download")
                .about("Download package archives without installing them")
                .arg(packages_arg()),
        ))
        .subcommand(transaction_args(
            Command::new("search-index").about("Rebuild the package search index"),
        ))
        .subcommand(
            Command::new("watch")
                .about("Follow a running transaction")
                .arg(Arg::new("id").required(true))
                .arg(socket_arg())
                .arg(
                    Arg::new("yes")
                        .short('y')
                        .long("yes")
                        .action(clap::ArgAction::SetTrue)
                        .help("Answer every prompt with yes"),
                ),
        )
        .subcommand(
            Command::new("cancel")
                .about("Cancel a transaction")
                .arg(Arg::new("id").required(true))
                .arg(socket_arg()),
        )
        .subcommand(
            Command::new("show")
                .about("Show every property of a transaction")
                .arg(Arg::new("id").required(true))
                .arg(socket_arg()),
        )
        .subcommand(
            Command::new("queue")
                .about("Show the transaction queue")
                .arg(socket_arg())
                .arg(
                    Arg::new("follow")
                        .short('f')
                        .long("follow")
                        .action(clap::ArgAction::SetTrue)
                        .help("Keep printing queue changes"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory - use CARGO_MANIFEST_DIR which is always set by cargo
    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    // Generate main man page
    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();

    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("pkgworker.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
        return;
    }

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
