//! Walks a demo workspace and prints every reachable object.
//!
//! Builds an in-memory core, populates a workspace through the api
//! machinery, then drives the walker over it. Run with
//! `cargo run --example qwalk`.

use std::sync::Arc;

use clap::Parser;
use quantumfs::api::server::{ApiHandler, CoreHandler};
use quantumfs::api::ExtendedKey;
use quantumfs::codec::record::ObjectType;
use quantumfs::datastore::store_block;
use quantumfs::key::KeyType;
use quantumfs::walker::{walk, WalkControl, WalkMode};
use quantumfs::wsdb::{WorkspaceDb, NULL_SPACE_NAME};
use quantumfs::Core;

#[derive(Parser)]
#[command(about = "Populate an in-memory workspace and walk it")]
struct Args {
    /// Workspace to create and walk, as typespace/namespace/workspace.
    #[arg(default_value = "demo/area/ws")]
    workspace: String,

    /// Abort on the first error instead of skipping failed hierarchies.
    #[arg(long)]
    fail_fast: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let core = Arc::new(Core::in_memory().expect("in-memory core"));
    let handler = CoreHandler::new(core.clone());

    let null = format!("{NULL_SPACE_NAME}/{NULL_SPACE_NAME}/{NULL_SPACE_NAME}");
    handler.branch_workspace(&null, &args.workspace).await.expect("branch demo workspace");

    for (path, contents) in [
        ("etc/hostname", "sandbox-1\n"),
        ("usr/bin/cc", "pretend this is a compiler\n"),
        ("usr/include/stdio.h", "int printf(const char *, ...);\n"),
    ] {
        let bytes = contents.as_bytes().to_vec();
        let key = store_block(core.datastore.as_ref(), KeyType::Data, bytes.clone())
            .await
            .expect("store demo block");
        let extended = ExtendedKey {
            key,
            object_type: ObjectType::SmallFile,
            size: bytes.len() as u64,
        };
        handler
            .insert_inode(
                &format!("{}/{}", args.workspace, path),
                extended,
                0,
                0,
                0o644,
            )
            .await
            .expect("insert demo file");
    }

    let parts: Vec<&str> = args.workspace.split('/').collect();
    let (root, _) = core
        .wsdb
        .workspace(parts[0], parts[1], parts[2])
        .await
        .expect("resolve workspace root");

    let mode = if args.fail_fast { WalkMode::FailFast } else { WalkMode::BestEffort };
    let mut visitor = |item: &quantumfs::walker::WalkItem<'_>| {
        match item.error {
            Some(err) => println!("{:60} !! {err}", item.path),
            None => println!("{:60} {:?} {:>8}B {}", item.path, item.object_type, item.size, item.key),
        }
        Ok(WalkControl::Continue)
    };
    walk(core.datastore.as_ref(), &root, mode, &mut visitor).await.expect("walk workspace");
}
