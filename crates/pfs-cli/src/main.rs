#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use pfs::{
    ByteDevice, FileByteDevice, InodeNumber, MetricsSnapshot, MountOptions, NewInode,
    PAGE_SIZE, PAGE_SIZE_U64, PageFs, PoolStats, Reply, Request, StatFs,
};
use pfs_ondisk::{Superblock, parse_header_page};
use serde::Serialize;
use std::env;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Serialize)]
struct DeviceOutput {
    uuid: String,
    blocks: u64,
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    version: String,
    uuid: String,
    flags: u32,
    blocks: u64,
    image_pages: u64,
    wtime_ns: u64,
    id_index: u16,
    checksum: u32,
    devices: Vec<DeviceOutput>,
}

#[derive(Debug, Serialize)]
struct ProbeOutput {
    region: String,
    statfs: StatFs,
    pool: PoolStats,
    metrics: MetricsSnapshot,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires a path argument");
            };
            let json = args.any(|arg| arg == "--json");
            let output = inspect(Path::new(&path))?;
            print_inspect(&output, json)
        }
        "probe" => {
            let Some(path) = args.next() else {
                bail!("probe requires a path argument");
            };
            let remaining: Vec<String> = args.collect();
            let json = remaining.iter().any(|a| a == "--json");
            let validate = !remaining.iter().any(|a| a == "--skip-validate");
            let output = probe(Path::new(&path), validate)?;
            print_probe(&output, json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("pfs-cli\n");
    println!("USAGE:");
    println!("  pfs-cli inspect <image-path> [--json]");
    println!("  pfs-cli probe <image-path> [--json] [--skip-validate]");
    println!();
    println!("probe mounts the image read-write and rewrites its arena.");
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn open_image(path: &Path) -> Result<Arc<dyn ByteDevice>> {
    let dev = FileByteDevice::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?;
    Ok(Arc::new(dev))
}

fn inspect_output(sb: &Superblock, image_pages: u64) -> InspectOutput {
    InspectOutput {
        version: format!("{}.{}", sb.major, sb.minor),
        uuid: hex(&sb.uuid),
        flags: sb.flags,
        blocks: sb.blocks,
        image_pages,
        wtime_ns: sb.wtime_ns,
        id_index: sb.id_index,
        checksum: sb.checksum,
        devices: sb
            .devices
            .iter()
            .map(|d| DeviceOutput {
                uuid: hex(&d.uuid),
                blocks: d.blocks,
            })
            .collect(),
    }
}

fn inspect(path: &Path) -> Result<InspectOutput> {
    let dev = open_image(path)?;
    let mut page = vec![0_u8; PAGE_SIZE];
    dev.read_exact_at(0, &mut page)
        .with_context(|| format!("failed to read superblock page of {}", path.display()))?;
    let sb = parse_header_page(&page)
        .with_context(|| format!("no valid superblock in {}", path.display()))?;
    Ok(inspect_output(&sb, dev.len_bytes() / PAGE_SIZE_U64))
}

fn print_inspect(output: &InspectOutput, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(output).context("serialize output")?
        );
        return Ok(());
    }
    println!("PageFS Inspector");
    println!("version: {}", output.version);
    println!("uuid: {}", output.uuid);
    println!("flags: {:#x}", output.flags);
    println!("blocks: {}", output.blocks);
    println!("image_pages: {}", output.image_pages);
    println!("wtime_ns: {}", output.wtime_ns);
    println!("checksum: {:#010x}", output.checksum);
    for (i, dev) in output.devices.iter().enumerate() {
        let marker = if i == usize::from(output.id_index) { " (this)" } else { "" };
        println!("device[{i}]: {} blocks={}{marker}", dev.uuid, dev.blocks);
    }
    Ok(())
}

/// Mount the image, run a create/write/clone/read round through the
/// dispatcher, then unmount.
fn probe(path: &Path, validate: bool) -> Result<ProbeOutput> {
    let dev = open_image(path)?;
    let options = MountOptions {
        validate_superblock: validate,
        ..MountOptions::persistent(dev)
    };
    let fs = PageFs::mount(options)
        .with_context(|| format!("failed to mount {}", path.display()))?;
    smoke_round(&fs).context("probe round failed")?;
    let output = ProbeOutput {
        region: fs.region_kind().to_string(),
        statfs: fs.statfs(),
        pool: fs.pool_stats(),
        metrics: fs.metrics().snapshot(),
    };
    fs.unmount().context("unmount failed")?;
    Ok(output)
}

fn expect_ok(fs: &PageFs, req: Request) -> Result<Reply> {
    let op = req.name();
    let resp = fs.dispatch(req);
    if !resp.is_ok() {
        bail!("{op} failed with errno {}", -resp.code);
    }
    Ok(resp.reply)
}

fn new_file(fs: &PageFs, name: &[u8]) -> Result<InodeNumber> {
    let root = fs.root_ino();
    let Reply::Attr(attr) = expect_ok(
        fs,
        Request::NewInode {
            dir: root,
            spec: NewInode::regular(0o644),
        },
    )?
    else {
        bail!("new_inode returned no attributes");
    };
    expect_ok(
        fs,
        Request::AddDentry {
            dir: root,
            ino: attr.ino,
            name: name.to_vec(),
        },
    )?;
    Ok(attr.ino)
}

fn smoke_round(fs: &PageFs) -> Result<()> {
    let payload = b"pagefs probe".repeat(512);
    let src = new_file(fs, b".probe-src")?;
    let dst = new_file(fs, b".probe-dst")?;
    expect_ok(
        fs,
        Request::Write {
            ino: src,
            off: 0,
            data: payload.clone(),
        },
    )?;
    expect_ok(
        fs,
        Request::Clone {
            src,
            dst,
            src_off: 0,
            dst_off: 0,
            len: 0,
        },
    )?;
    let Reply::Data(back) = expect_ok(
        fs,
        Request::Read {
            ino: dst,
            off: 0,
            len: payload.len(),
        },
    )?
    else {
        bail!("read returned no data");
    };
    if back != payload {
        bail!("cloned file content differs from source");
    }
    for (name, ino) in [(&b".probe-src"[..], src), (&b".probe-dst"[..], dst)] {
        expect_ok(
            fs,
            Request::RemoveDentry {
                dir: fs.root_ino(),
                name: name.to_vec(),
            },
        )?;
        expect_ok(fs, Request::FreeInode { ino })?;
    }
    Ok(())
}

fn print_probe(output: &ProbeOutput, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(output).context("serialize output")?
        );
        return Ok(());
    }
    println!("PageFS Probe");
    println!("region: {}", output.region);
    println!("block_size: {}", output.statfs.bsize);
    println!("blocks: {}", output.statfs.blocks);
    println!("bfree: {}", output.statfs.bfree);
    println!("files: {}", output.statfs.files);
    println!("ffree: {}", output.statfs.ffree);
    println!("free_pages: {}", output.pool.free_pages);
    println!(
        "requests: {} ok, {} failed",
        output.metrics.requests_ok, output.metrics.requests_err
    );
    Ok(())
}
