//! Thin command-line driver: list or extract the contents of a UBI or
//! bare UBIFS image. All decoding happens in the library; this binary
//! only wires configuration and owns the host-filesystem side effects.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::warn;

use ubiread::ubifs::crypt::MasterKey;
use ubiread::ubifs::emit::{Emitter, InodeMeta, Warning};
use ubiread::DecodeOptions;

#[derive(Parser)]
#[command(name = "ubiread", version, about = "List and extract files of a UBI or UBIFS image")]
struct Cli {
    /// UBI/UBIFS image file.
    image: PathBuf,

    /// PEB size in bytes (UBI only; guessed when omitted).
    #[arg(short = 'p', long)]
    peb_size: Option<u32>,

    /// LEB size in bytes (bare UBIFS only; guessed when omitted).
    #[arg(short = 'e', long)]
    leb_size: Option<u32>,

    /// Offset of UBI/UBIFS data in the file.
    #[arg(short = 's', long)]
    start_offset: Option<u64>,

    /// Exclusive end offset of UBI/UBIFS data in the file.
    #[arg(short = 'n', long)]
    end_offset: Option<u64>,

    /// Offset to start guessing where the data is in the file.
    #[arg(short = 'g', long)]
    guess_offset: Option<u64>,

    /// Keep going on bad block reads; some data will be missing.
    #[arg(short = 'w', long)]
    warn_only_block_read_errors: bool,

    /// Include blocks with bad EC/VID headers.
    #[arg(short = 'i', long)]
    ignore_block_header_errors: bool,

    /// Treat blocks with image_seq 0 as part of the dominant image.
    #[arg(short = 'f', long = "u-boot-fix")]
    uboot_fix: bool,

    /// File holding the 64-byte fscrypt v1 master key.
    #[arg(short = 'K', long)]
    master_key: Option<PathBuf>,

    /// Write device nodes as files containing the packed device number.
    #[arg(long)]
    use_dummy_devices: bool,

    /// Write sockets as empty files.
    #[arg(long)]
    use_dummy_socket_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print every decoded entry.
    List,

    /// Extract the tree under a directory.
    Extract { outdir: PathBuf },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let options = build_options(&cli)?;

    let source = File::open(&cli.image)
        .with_context(|| format!("cannot open {}", cli.image.display()))?;

    let mut emitter: Box<dyn Emitter> = match &cli.command {
        Command::List => Box::new(ListEmitter),
        Command::Extract { outdir } => {
            std::fs::create_dir_all(outdir)
                .with_context(|| format!("cannot create {}", outdir.display()))?;
            Box::new(ExtractEmitter {
                root: outdir.clone(),
            })
        }
    };

    ubiread::decode_image(source, &options, emitter.as_mut())
        .with_context(|| format!("decoding {} failed", cli.image.display()))?;

    Ok(())
}

fn build_options(cli: &Cli) -> Result<DecodeOptions> {
    let master_key = match &cli.master_key {
        Some(path) => {
            let raw = std::fs::read(path)
                .with_context(|| format!("cannot read master key {}", path.display()))?;
            if raw.len() != 64 {
                bail!("master key file must hold exactly 64 bytes, has {}", raw.len());
            }
            Some(MasterKey::from_bytes(&raw).expect("length checked above"))
        }
        None => None,
    };

    Ok(DecodeOptions {
        peb_size: cli.peb_size,
        leb_size: cli.leb_size,
        start_offset: cli.start_offset,
        end_offset: cli.end_offset,
        guess_offset: cli.guess_offset,
        warn_only_block_read_errors: cli.warn_only_block_read_errors,
        ignore_block_header_errors: cli.ignore_block_header_errors,
        uboot_fix: cli.uboot_fix,
        master_key,
        use_dummy_devices: cli.use_dummy_devices,
        use_dummy_socket_file: cli.use_dummy_socket_file,
    })
}

/// Prints one line per decoded entry.
struct ListEmitter;

impl Emitter for ListEmitter {
    fn on_dir(&mut self, path: &str, meta: &InodeMeta) {
        println!("d {path} (mode {:o})", meta.mode & 0o7777);
    }

    fn on_file(&mut self, path: &str, _meta: &InodeMeta, body: &[u8]) {
        println!("f {path} ({} bytes)", body.len());
    }

    fn on_symlink(&mut self, path: &str, target: &str, _meta: &InodeMeta) {
        println!("l {path} -> {target}");
    }

    fn on_device(&mut self, path: &str, _meta: &InodeMeta, major: u32, minor: u32) {
        println!("c/b {path} ({major}:{minor})");
    }

    fn on_fifo(&mut self, path: &str, _meta: &InodeMeta) {
        println!("p {path}");
    }

    fn on_sock(&mut self, path: &str, _meta: &InodeMeta) {
        println!("s {path}");
    }

    fn on_hardlink(&mut self, path: &str, target: &str) {
        println!("h {path} => {target}");
    }

    fn on_warning(&mut self, warning: &Warning) {
        eprintln!("warning: {:?}: {}", warning.kind, warning.detail);
    }
}

/// Writes decoded entries below a root directory.
///
/// Devices, fifos and sockets degrade to warnings unless the dummy-file
/// options turned them into plain files already; a portable extractor
/// has no business calling mknod.
struct ExtractEmitter {
    root: PathBuf,
}

impl ExtractEmitter {
    fn host_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    #[cfg(unix)]
    fn apply_mode(path: &Path, meta: &InodeMeta) {
        use std::os::unix::fs::PermissionsExt;

        let perms = std::fs::Permissions::from_mode(meta.mode & 0o7777);
        if let Err(e) = std::fs::set_permissions(path, perms) {
            warn!("cannot set mode on {}: {e}", path.display());
        }
    }

    #[cfg(not(unix))]
    fn apply_mode(_path: &Path, _meta: &InodeMeta) {}
}

impl Emitter for ExtractEmitter {
    fn on_dir(&mut self, path: &str, meta: &InodeMeta) {
        let host = self.host_path(path);
        if let Err(e) = std::fs::create_dir_all(&host) {
            warn!("mkdir {}: {e}", host.display());
            return;
        }
        Self::apply_mode(&host, meta);
    }

    fn on_file(&mut self, path: &str, meta: &InodeMeta, body: &[u8]) {
        let host = self.host_path(path);
        if let Err(e) = std::fs::write(&host, body) {
            warn!("write {}: {e}", host.display());
            return;
        }
        Self::apply_mode(&host, meta);
    }

    fn on_symlink(&mut self, path: &str, target: &str, _meta: &InodeMeta) {
        let host = self.host_path(path);

        #[cfg(unix)]
        if let Err(e) = std::os::unix::fs::symlink(target, &host) {
            warn!("symlink {}: {e}", host.display());
        }

        #[cfg(not(unix))]
        if let Err(e) = std::fs::write(&host, target) {
            warn!("symlink placeholder {}: {e}", host.display());
        }
    }

    fn on_device(&mut self, path: &str, _meta: &InodeMeta, major: u32, minor: u32) {
        warn!("not creating device node {path} ({major}:{minor}); use --use-dummy-devices");
    }

    fn on_fifo(&mut self, path: &str, _meta: &InodeMeta) {
        warn!("not creating fifo {path}");
    }

    fn on_sock(&mut self, path: &str, _meta: &InodeMeta) {
        warn!("not creating socket {path}; use --use-dummy-socket-file");
    }

    fn on_hardlink(&mut self, path: &str, target: &str) {
        let (host, first) = (self.host_path(path), self.host_path(target));
        if let Err(e) = std::fs::hard_link(&first, &host) {
            warn!("hardlink {}: {e}", host.display());
        }
    }

    fn on_warning(&mut self, warning: &Warning) {
        warn!("{:?}: {}", warning.kind, warning.detail);
    }
}
