#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use btr_block::FileByteDevice;
use btr_ondisk::{Superblock, decode_payload};
use btr_rescue::checksum::{RepairMode, fix_data_checksum};
use btr_rescue::chunk_recover::{ChunkRecoveryStatus, chunk_recover};
use btr_rescue::open::{ChunkMappedStore, find_root_item, open_filesystem};
use btr_rescue::prompt::{AutoConfirm, Prompter, StdinPrompter};
use btr_rescue::super_recover::{SuperRecoveryStatus, super_recover};
use btr_rescue::{
    clear_space_cache_v1, clear_uuid_tree, ensure_not_mounted, fix_device_size, zero_log,
};
use btr_tree::{BlockStore, TreeBlock, walk_bfs, walk_dfs};
use btr_types::{
    CSUM_TREE_OBJECTID, DEV_TREE_OBJECTID, EXTENT_TREE_OBJECTID, FS_TREE_OBJECTID,
    UUID_TREE_OBJECTID, csum_type_size,
};
use std::env;
use std::path::Path;
use std::process::ExitCode;

/// Either the interactive stdin prompter or a fixed `--yes` answer.
enum CliPrompter {
    Stdin(StdinPrompter),
    Auto(AutoConfirm),
}

impl Prompter for CliPrompter {
    fn confirm(&mut self, question: &str) -> btr_error::Result<bool> {
        match self {
            Self::Stdin(p) => p.confirm(question),
            Self::Auto(p) => p.confirm(question),
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<ExitCode> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(ExitCode::from(1));
    };
    let rest: Vec<String> = args.collect();

    match command.as_str() {
        "super-recover" => super_recover_cmd(&rest),
        "chunk-recover" => chunk_recover_cmd(&rest),
        "fix-data-checksum" => fix_data_checksum_cmd(&rest),
        "zero-log" => zero_log_cmd(&rest),
        "fix-device-size" => fix_device_size_cmd(&rest),
        "clear-uuid-tree" => clear_uuid_tree_cmd(&rest),
        "clear-space-cache" => clear_space_cache_cmd(&rest),
        "inspect" => inspect_cmd(&rest),
        "dump-tree" => dump_tree_cmd(&rest),
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(ExitCode::SUCCESS)
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("btrescue\n");
    println!("USAGE:");
    println!("  btrescue super-recover <device> [--yes] [--json]");
    println!("  btrescue chunk-recover <device> [--yes] [--json]");
    println!("  btrescue fix-data-checksum <device> [--repair | --mirror <n>] [--yes] [--json]");
    println!("  btrescue zero-log <device> [--json]");
    println!("  btrescue fix-device-size <device> [--json]");
    println!("  btrescue clear-uuid-tree <device> [--json]");
    println!("  btrescue clear-space-cache <device> [--json]");
    println!("  btrescue inspect <device> [--json]");
    println!("  btrescue dump-tree <device> [--tree <name-or-bytenr>] [--bfs] [--json]");
}

/// First positional argument is the device path; flags may come in any
/// order after it.
fn device_arg<'a>(args: &'a [String], command: &str) -> Result<&'a Path> {
    let path = args
        .iter()
        .find(|arg| !arg.starts_with("--"))
        .with_context(|| format!("{command} requires a device path"))?;
    Ok(Path::new(path))
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|arg| arg == flag)
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == flag {
            return iter.next().map(String::as_str);
        }
    }
    None
}

fn prompter(args: &[String]) -> CliPrompter {
    if has_flag(args, "--yes") {
        CliPrompter::Auto(AutoConfirm(true))
    } else {
        CliPrompter::Stdin(StdinPrompter)
    }
}

fn open_device(path: &Path) -> Result<FileByteDevice> {
    ensure_not_mounted(path)?;
    FileByteDevice::open(path)
        .with_context(|| format!("failed to open device {}", path.display()))
}

fn open_device_readonly(path: &Path) -> Result<FileByteDevice> {
    ensure_not_mounted(path)?;
    FileByteDevice::open_readonly(path)
        .with_context(|| format!("failed to open device {}", path.display()))
}

fn super_recover_cmd(args: &[String]) -> Result<ExitCode> {
    let device = open_device(device_arg(args, "super-recover")?)?;
    let report = super_recover(&device, &mut prompter(args))?;

    if has_flag(args, "--json") {
        println!("{}", report.to_json()?);
    } else {
        for copy in &report.copies {
            match copy.generation {
                Some(generation) => {
                    println!("copy at {}: valid, generation {generation}", copy.offset);
                }
                None => println!("copy at {}: invalid", copy.offset),
            }
        }
        match report.status {
            SuperRecoveryStatus::AllValid => println!("all superblock copies are valid"),
            SuperRecoveryStatus::Recovered => {
                println!("rewrote {} superblock copies", report.copies_rewritten);
            }
            SuperRecoveryStatus::Failed => println!("no valid superblock copy to recover from"),
            SuperRecoveryStatus::Aborted => println!("aborted, nothing written"),
        }
    }
    Ok(ExitCode::from(match report.status {
        SuperRecoveryStatus::AllValid => 0,
        SuperRecoveryStatus::Recovered => 2,
        SuperRecoveryStatus::Failed => 3,
        SuperRecoveryStatus::Aborted => 4,
    }))
}

fn chunk_recover_cmd(args: &[String]) -> Result<ExitCode> {
    let device = open_device(device_arg(args, "chunk-recover")?)?;
    let report = chunk_recover(&device, &mut prompter(args))?;

    if has_flag(args, "--json") {
        println!("{}", report.to_json()?);
    } else {
        match report.status {
            ChunkRecoveryStatus::Recovered => println!(
                "rebuilt the chunk tree from {} chunks found in {} leaves",
                report.chunks_recovered, report.leaves_found
            ),
            ChunkRecoveryStatus::Aborted => println!("aborted, nothing written"),
            ChunkRecoveryStatus::Failed => println!("chunk recovery failed, device unchanged"),
        }
    }
    Ok(match report.status {
        ChunkRecoveryStatus::Recovered | ChunkRecoveryStatus::Aborted => ExitCode::SUCCESS,
        ChunkRecoveryStatus::Failed => ExitCode::from(1),
    })
}

fn fix_data_checksum_cmd(args: &[String]) -> Result<ExitCode> {
    let device = open_device(device_arg(args, "fix-data-checksum")?)?;
    let mode = if let Some(mirror) = flag_value(args, "--mirror") {
        let mirror: usize = mirror
            .parse()
            .with_context(|| format!("invalid mirror number: {mirror}"))?;
        RepairMode::UpdateFromMirror { mirror }
    } else if has_flag(args, "--repair") {
        RepairMode::Interactive
    } else {
        RepairMode::ReadOnly
    };

    let report = fix_data_checksum(&device, mode, &mut prompter(args))?;
    if has_flag(args, "--json") {
        println!("{}", report.to_json()?);
    } else {
        println!(
            "checked {} sectors: {} mismatches, {} repaired",
            report.sectors_checked, report.mismatches, report.repaired
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn zero_log_cmd(args: &[String]) -> Result<ExitCode> {
    let device = open_device(device_arg(args, "zero-log")?)?;
    let report = zero_log(&device)?;
    if has_flag(args, "--json") {
        println!("{}", report.to_json()?);
    } else if report.copies_updated == 0 {
        println!("log tree already clear");
    } else {
        println!(
            "cleared log root {} in {} superblock copies",
            report.previous_log_root, report.copies_updated
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn fix_device_size_cmd(args: &[String]) -> Result<ExitCode> {
    let device = open_device(device_arg(args, "fix-device-size")?)?;
    let report = fix_device_size(&device)?;
    if has_flag(args, "--json") {
        println!("{}", report.to_json()?);
    } else if report.copies_updated == 0 {
        println!("device size already aligned at {} bytes", report.new_total_bytes);
    } else {
        println!(
            "total_bytes {} -> {} in {} superblock copies",
            report.old_total_bytes, report.new_total_bytes, report.copies_updated
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn clear_uuid_tree_cmd(args: &[String]) -> Result<ExitCode> {
    let device = open_device(device_arg(args, "clear-uuid-tree")?)?;
    let report = clear_uuid_tree(&device)?;
    if has_flag(args, "--json") {
        println!("{}", report.to_json()?);
    } else if report.copies_updated == 0 {
        println!("no uuid tree present, nothing to clear");
    } else {
        println!(
            "deleted {} uuid items, the kernel will rebuild the tree on mount",
            report.items_deleted
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn clear_space_cache_cmd(args: &[String]) -> Result<ExitCode> {
    let device = open_device(device_arg(args, "clear-space-cache")?)?;
    let report = clear_space_cache_v1(&device)?;
    if has_flag(args, "--json") {
        println!("{}", report.to_json()?);
    } else if report.copies_updated == 0 {
        println!("v1 space cache already invalidated");
    } else {
        println!(
            "invalidated the v1 space cache in {} superblock copies",
            report.copies_updated
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn inspect_cmd(args: &[String]) -> Result<ExitCode> {
    let device = open_device_readonly(device_arg(args, "inspect")?)?;
    let sb = btr_rescue::load_superblock(&device)?;

    if has_flag(args, "--json") {
        println!("{}", serde_json::to_string_pretty(&sb).context("serialize superblock")?);
    } else {
        println!("label: {}", sb.label);
        println!("fsid: {}", hex(&sb.fsid));
        println!("generation: {}", sb.generation);
        println!("root tree: {}", sb.root);
        println!("chunk tree: {}", sb.chunk_root);
        println!("log tree: {}", sb.log_root);
        println!("total_bytes: {}", sb.total_bytes);
        println!("bytes_used: {}", sb.bytes_used);
        println!("num_devices: {}", sb.num_devices);
        println!("sectorsize: {}", sb.sectorsize);
        println!("nodesize: {}", sb.nodesize);
        println!("csum_type: {}", sb.csum_type);
    }
    Ok(ExitCode::SUCCESS)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Resolve `--tree` to a root bytenr: a well-known tree name or a raw
/// logical address.
fn resolve_tree_root<S: BlockStore>(
    store: &S,
    sb: &Superblock,
    name: &str,
) -> Result<u64> {
    let objectid = match name {
        "root" => return Ok(sb.root),
        "chunk" => return Ok(sb.chunk_root),
        "extent" => EXTENT_TREE_OBJECTID,
        "dev" => DEV_TREE_OBJECTID,
        "fs" => FS_TREE_OBJECTID,
        "csum" => CSUM_TREE_OBJECTID,
        "uuid" => UUID_TREE_OBJECTID,
        other => {
            return other
                .parse()
                .with_context(|| format!("unknown tree name or bytenr: {other}"));
        }
    };
    let item = find_root_item(store, sb.root, objectid)?
        .with_context(|| format!("the root tree has no entry for the {name} tree"))?;
    Ok(item.bytenr)
}

fn dump_tree_cmd(args: &[String]) -> Result<ExitCode> {
    let device = open_device_readonly(device_arg(args, "dump-tree")?)?;
    let info = open_filesystem(&device)?;
    let sb = info.superblock;
    let store = ChunkMappedStore::new(&device, info.chunk_map, sb.nodesize as usize);
    let csum_size = csum_type_size(sb.csum_type)
        .with_context(|| format!("unrecognized checksum type {}", sb.csum_type))?;

    let tree_name = flag_value(args, "--tree").unwrap_or("root");
    let root = resolve_tree_root(&store, &sb, tree_name)?;
    let json = has_flag(args, "--json");

    let mut blocks: Vec<serde_json::Value> = Vec::new();
    let mut render = |block: &TreeBlock| -> btr_error::Result<()> {
        if json {
            blocks.push(block_to_json(block, csum_size));
        } else {
            print_block(block, csum_size);
        }
        Ok(())
    };
    let report = if has_flag(args, "--bfs") {
        walk_bfs(&store, root, &mut render)?
    } else {
        walk_dfs(&store, root, &mut render)?
    };

    if json {
        let dump = serde_json::json!({
            "tree": tree_name,
            "root": root,
            "blocks": blocks,
            "report": report,
        });
        println!("{}", serde_json::to_string_pretty(&dump).context("serialize dump")?);
    } else {
        println!(
            "visited {} blocks, {} leaves, {} corrupt children skipped",
            report.blocks_visited, report.leaves_visited, report.corrupt_children
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn payload_to_json(block: &TreeBlock, slot: usize, csum_size: usize) -> serde_json::Value {
    let error = |detail: String| serde_json::json!({ "kind": "error", "detail": detail });
    let key = match block.key(slot) {
        Ok(key) => key,
        Err(err) => return error(err.to_string()),
    };
    let data = match block.item_data(slot) {
        Ok(data) => data,
        Err(err) => return error(err.to_string()),
    };
    match decode_payload(key, data, csum_size) {
        Ok(payload) => serde_json::to_value(&payload).unwrap_or_else(|err| error(err.to_string())),
        Err(err) => error(err.to_string()),
    }
}

fn block_to_json(block: &TreeBlock, csum_size: usize) -> serde_json::Value {
    let mut items: Vec<serde_json::Value> = Vec::new();
    if block.is_leaf() {
        for slot in 0..block.nritems() {
            let key = match block.key(slot) {
                Ok(key) => key,
                Err(err) => {
                    items.push(serde_json::json!({ "kind": "error", "detail": err.to_string() }));
                    continue;
                }
            };
            items.push(serde_json::json!({
                "objectid": key.objectid,
                "type": key.item_type,
                "offset": key.offset,
                "payload": payload_to_json(block, slot, csum_size),
            }));
        }
    }
    serde_json::json!({
        "bytenr": block.bytenr(),
        "level": block.level(),
        "generation": block.generation(),
        "owner": block.owner(),
        "nritems": block.nritems(),
        "items": items,
    })
}

fn print_block(block: &TreeBlock, csum_size: usize) {
    if block.is_leaf() {
        println!(
            "leaf bytenr {} generation {} owner {} nritems {}",
            block.bytenr(),
            block.generation(),
            block.owner(),
            block.nritems(),
        );
    } else {
        println!(
            "node level {} bytenr {} generation {} owner {} nritems {}",
            block.level(),
            block.bytenr(),
            block.generation(),
            block.owner(),
            block.nritems(),
        );
        return;
    }
    for slot in 0..block.nritems() {
        match block.key(slot) {
            Ok(key) => println!(
                "\titem {slot} key ({} {} {}) {}",
                key.objectid,
                key.item_type,
                key.offset,
                payload_to_json(block, slot, csum_size)
            ),
            Err(err) => println!("\titem {slot} unreadable key: {err}"),
        }
    }
}
