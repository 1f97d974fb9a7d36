//! Emission of decoded entities to a consumer.
//!
//! The core never writes to the host filesystem. Instead the directory
//! tree is replayed onto an [`Emitter`]: one callback per entity kind,
//! plus warnings for everything non-fatal met along the way. The bundled
//! [`EventCollector`] records the same stream as plain values, which is
//! what the tests (and any in-memory consumer) use.
//!
//! Entries are visited in byte-wise name order, so decoding the same
//! image twice replays the identical event sequence.

use hashbrown::HashMap;
use log::warn;

use crate::err::UbifsError;
use crate::options::DecodeOptions;
use crate::ubifs::crypt::{self, EncryptionContext, FileKey, FSCRYPT_XATTR_NAME};
use crate::ubifs::file;
use crate::ubifs::nodes::{DentType, InoNode};
use crate::ubifs::walk::{InodeEntry, InodeMap};
use crate::ubifs::compress::{self, ComprType};

/// Root directory inode number.
pub const ROOT_INUM: u64 = 1;

/// Classification of a non-fatal decoding problem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WarningKind {
    /// A dent references an inode the index never produced.
    OrphanInode,

    /// A block-level read failed and zeroes were substituted.
    BlockReadError,

    /// Encrypted content could not be decrypted (no key, or bad data).
    DecryptError,

    /// The provided master key does not match a context's descriptor.
    KeyMismatch,

    /// A name would escape the logical root; the entry was dropped.
    UnsafePath,

    /// A node was malformed or unreadable and skipped.
    BadNode,

    /// Two PEBs claimed one LEB with equal sequence numbers.
    DuplicateLeb,
}

/// A non-fatal problem, as delivered to the consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Warning {
    pub kind: WarningKind,
    pub detail: String,
}

impl Warning {
    pub fn new(kind: WarningKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Ownership and timestamps of a decoded entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InodeMeta {
    pub inum: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u32,
    pub atime_sec: u64,
    pub mtime_sec: u64,
    pub ctime_sec: u64,
}

impl InodeMeta {
    fn from_ino(ino: &InoNode) -> Self {
        Self {
            inum: ino.inum(),
            mode: ino.mode(),
            uid: ino.uid(),
            gid: ino.gid(),
            size: ino.size(),
            nlink: ino.nlink(),
            atime_sec: ino.atime_sec(),
            mtime_sec: ino.mtime_sec(),
            ctime_sec: ino.ctime_sec(),
        }
    }
}

/// One decoded entity, in traversal order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Dir {
        path: String,
        meta: InodeMeta,
    },
    File {
        path: String,
        meta: InodeMeta,
        body: Vec<u8>,
    },
    Symlink {
        path: String,
        target: String,
        meta: InodeMeta,
    },
    Device {
        path: String,
        meta: InodeMeta,
        major: u32,
        minor: u32,
    },
    Fifo {
        path: String,
        meta: InodeMeta,
    },
    Sock {
        path: String,
        meta: InodeMeta,
    },
    Hardlink {
        path: String,
        target: String,
    },
    Warning(Warning),
}

/// Capability implemented by consumers of a decode pass.
///
/// Implementations own all host side effects; the decoder only calls
/// back. Paths are `/`-rooted and never contain `..` components.
pub trait Emitter {
    fn on_dir(&mut self, path: &str, meta: &InodeMeta);
    fn on_file(&mut self, path: &str, meta: &InodeMeta, body: &[u8]);
    fn on_symlink(&mut self, path: &str, target: &str, meta: &InodeMeta);
    fn on_device(&mut self, path: &str, meta: &InodeMeta, major: u32, minor: u32);
    fn on_fifo(&mut self, path: &str, meta: &InodeMeta);
    fn on_sock(&mut self, path: &str, meta: &InodeMeta);
    fn on_hardlink(&mut self, path: &str, target: &str);
    fn on_warning(&mut self, warning: &Warning);
}

/// [`Emitter`] that records the event stream in memory.
#[derive(Debug, Default)]
pub struct EventCollector {
    pub events: Vec<Event>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Warnings only, in emission order.
    pub fn warnings(&self) -> impl Iterator<Item = &Warning> {
        self.events.iter().filter_map(|e| match e {
            Event::Warning(w) => Some(w),
            _ => None,
        })
    }
}

impl Emitter for EventCollector {
    fn on_dir(&mut self, path: &str, meta: &InodeMeta) {
        self.events.push(Event::Dir {
            path: path.into(),
            meta: meta.clone(),
        });
    }

    fn on_file(&mut self, path: &str, meta: &InodeMeta, body: &[u8]) {
        self.events.push(Event::File {
            path: path.into(),
            meta: meta.clone(),
            body: body.to_vec(),
        });
    }

    fn on_symlink(&mut self, path: &str, target: &str, meta: &InodeMeta) {
        self.events.push(Event::Symlink {
            path: path.into(),
            target: target.into(),
            meta: meta.clone(),
        });
    }

    fn on_device(&mut self, path: &str, meta: &InodeMeta, major: u32, minor: u32) {
        self.events.push(Event::Device {
            path: path.into(),
            meta: meta.clone(),
            major,
            minor,
        });
    }

    fn on_fifo(&mut self, path: &str, meta: &InodeMeta) {
        self.events.push(Event::Fifo {
            path: path.into(),
            meta: meta.clone(),
        });
    }

    fn on_sock(&mut self, path: &str, meta: &InodeMeta) {
        self.events.push(Event::Sock {
            path: path.into(),
            meta: meta.clone(),
        });
    }

    fn on_hardlink(&mut self, path: &str, target: &str) {
        self.events.push(Event::Hardlink {
            path: path.into(),
            target: target.into(),
        });
    }

    fn on_warning(&mut self, warning: &Warning) {
        self.events.push(Event::Warning(warning.clone()));
    }
}

/// Replays a walked inode arena onto an emitter.
pub(crate) fn emit_tree(
    inodes: &InodeMap,
    options: &DecodeOptions,
    emitter: &mut dyn Emitter,
) -> Result<(), UbifsError> {
    let mut tree = TreeEmitter {
        inodes,
        options,
        emitter,
        hardlinks: HashMap::new(),
    };

    let Some((root, _)) = inodes.get(&ROOT_INUM).and_then(|e| e.ino.as_ref()) else {
        return Err(UbifsError::OrphanInode { inum: ROOT_INUM });
    };

    tree.emitter.on_dir("/", &InodeMeta::from_ino(root));
    tree.visit_dir(ROOT_INUM, "/");

    Ok(())
}

struct TreeEmitter<'a> {
    inodes: &'a InodeMap,
    options: &'a DecodeOptions,
    emitter: &'a mut dyn Emitter,

    /// First emitted path per multiply-linked inode.
    hardlinks: HashMap<u64, String>,
}

impl TreeEmitter<'_> {
    fn warn(&mut self, kind: WarningKind, detail: String) {
        warn!("ubifs: {detail}");
        self.emitter.on_warning(&Warning { kind, detail });
    }

    fn visit_dir(&mut self, inum: u64, path: &str) {
        let Some(entry) = self.inodes.get(&inum) else {
            return;
        };

        let dir_ctx = self.context_of(inum);

        let mut dents: Vec<_> = entry.dents.iter().collect();
        dents.sort_by(|a, b| a.name.cmp(&b.name));

        for dent in dents {
            let Some(name) = self.resolve_name(&dent.name, dir_ctx.as_ref(), path) else {
                continue;
            };

            let child_path = if path == "/" {
                format!("/{name}")
            } else {
                format!("{path}/{name}")
            };

            let child_inum = dent.node.inum();
            let Some((ino, inline)) = self
                .inodes
                .get(&child_inum)
                .and_then(|e| e.ino.as_ref())
                .map(|(ino, data)| (*ino, data.clone()))
            else {
                self.warn(
                    WarningKind::OrphanInode,
                    format!("dent {child_path} references unknown inode {child_inum}"),
                );
                continue;
            };

            self.check_xattrs(child_inum, &child_path);

            let meta = InodeMeta::from_ino(&ino);

            match dent.node.dtype() {
                DentType::DIR => {
                    self.emitter.on_dir(&child_path, &meta);
                    self.visit_dir(child_inum, &child_path);
                }
                DentType::REG => self.visit_file(child_inum, &child_path, &meta),
                DentType::LNK => match self.symlink_target(child_inum, &ino, &inline) {
                    Ok(target) => self.emitter.on_symlink(&child_path, &target, &meta),
                    Err(e) => self.warn(
                        WarningKind::DecryptError,
                        format!("symlink {child_path}: {e}"),
                    ),
                },
                DentType::BLK | DentType::CHR => self.visit_device(&child_path, &meta, &inline),
                DentType::FIFO => self.emitter.on_fifo(&child_path, &meta),
                DentType::SOCK => {
                    if self.options.use_dummy_socket_file {
                        self.emitter.on_file(&child_path, &meta, &[]);
                    } else {
                        self.emitter.on_sock(&child_path, &meta);
                    }
                }
                other => self.warn(
                    WarningKind::BadNode,
                    format!("{child_path}: unknown entry type {}", other.0),
                ),
            }
        }
    }

    fn visit_file(&mut self, inum: u64, path: &str, meta: &InodeMeta) {
        if meta.nlink > 1 {
            if let Some(first) = self.hardlinks.get(&inum).cloned() {
                self.emitter.on_hardlink(path, &first);
                return;
            }
        }

        match self.file_body(inum, path) {
            Ok(body) => {
                self.emitter.on_file(path, meta, &body);
                if meta.nlink > 1 {
                    self.hardlinks.insert(inum, path.to_owned());
                }
            }
            Err(e) => self.warn(WarningKind::BadNode, format!("file {path}: {e}")),
        }
    }

    /// Rebuilds one file body, degrading to ciphertext with a warning
    /// when an encrypted file cannot be decrypted.
    fn file_body(&mut self, inum: u64, path: &str) -> Result<Vec<u8>, UbifsError> {
        let entry = self
            .inodes
            .get(&inum)
            .ok_or(UbifsError::OrphanInode { inum })?;
        let encrypted = entry
            .ino
            .as_ref()
            .map_or(false, |(ino, _)| ino.is_encrypted());

        if !encrypted {
            return file::reassemble(inum, entry, None);
        }

        match self.file_key(inum, path) {
            Some(key) => file::reassemble(inum, entry, Some(&key)),
            None => {
                self.warn(
                    WarningKind::DecryptError,
                    format!("file {path}: emitting undecrypted content"),
                );
                file::reassemble_ciphertext(inum, entry)
            }
        }
    }

    fn visit_device(&mut self, path: &str, meta: &InodeMeta, inline: &[u8]) {
        let Some(packed) = packed_dev(inline) else {
            self.warn(
                WarningKind::BadNode,
                format!("device {path}: malformed device number ({} bytes)", inline.len()),
            );
            return;
        };

        if self.options.use_dummy_devices {
            self.emitter
                .on_file(path, meta, packed.to_string().as_bytes());
        } else {
            let (major, minor) = decode_dev(packed);
            self.emitter.on_device(path, meta, major, minor);
        }
    }

    /// Decrypts (or transliterates) one directory-entry name and checks
    /// it cannot escape the logical root.
    fn resolve_name(
        &mut self,
        raw: &[u8],
        dir_ctx: Option<&EncryptionContext>,
        dir_path: &str,
    ) -> Option<String> {
        let name = match dir_ctx {
            None => String::from_utf8_lossy(raw).into_owned(),
            Some(ctx) => match self.key_for(ctx, dir_path) {
                Some(key) => match key.decrypt_name(raw) {
                    Ok(clear) => String::from_utf8_lossy(&clear).into_owned(),
                    Err(e) => {
                        self.warn(
                            WarningKind::DecryptError,
                            format!("name in {dir_path}: {e}"),
                        );
                        crypt::undecryptable_name(raw)
                    }
                },
                None => crypt::undecryptable_name(raw),
            },
        };

        if name.is_empty() || name == "." || name == ".." || name.contains(&['/', '\0'][..]) {
            self.warn(
                WarningKind::UnsafePath,
                format!("discarding traversal-unsafe name {name:?} in {dir_path}"),
            );
            return None;
        }

        Some(name)
    }

    fn symlink_target(
        &mut self,
        inum: u64,
        ino: &InoNode,
        inline: &[u8],
    ) -> Result<String, UbifsError> {
        if ino.is_encrypted() {
            // Encrypted symlinks prefix the ciphertext with its length.
            if inline.len() < 2 {
                return Err(UbifsError::Crypto(crate::err::CryptoError::DecryptError {
                    reason: "encrypted symlink target too short",
                }));
            }
            let ct_len = usize::from(u16::from_le_bytes(inline[..2].try_into().unwrap()));
            let ct = inline
                .get(2..2 + ct_len)
                .ok_or(UbifsError::Crypto(crate::err::CryptoError::DecryptError {
                    reason: "encrypted symlink target truncated",
                }))?;

            let ctx = self.context_of(inum);
            let key = ctx
                .as_ref()
                .and_then(|ctx| self.key_for(ctx, "<symlink>"));
            return match key {
                Some(key) => {
                    let clear = key.decrypt_name(ct).map_err(UbifsError::Crypto)?;
                    Ok(String::from_utf8_lossy(&clear).into_owned())
                }
                None => Ok(crypt::undecryptable_name(ct)),
            };
        }

        // Inline data shorter than the logical size means the target was
        // worth compressing.
        if (inline.len() as u64) < ino.size() {
            let clear = compress::decompress(
                ComprType::from_raw(ino.compr_type()),
                inline,
                ino.size() as usize,
            )
            .map_err(|e| UbifsError::Decompress {
                inum,
                block: 0,
                reason: e.to_string(),
            })?;
            return Ok(String::from_utf8_lossy(&clear).into_owned());
        }

        Ok(String::from_utf8_lossy(inline).into_owned())
    }

    /// The encryption context of `inum`, from its `c` xattr.
    fn context_of(&mut self, inum: u64) -> Option<EncryptionContext> {
        let entry = self.inodes.get(&inum)?;
        let xent = entry
            .xents
            .iter()
            .find(|x| x.name == FSCRYPT_XATTR_NAME.as_bytes())?;

        let (_, value) = self.inodes.get(&xent.node.inum())?.ino.as_ref()?;
        match EncryptionContext::parse(value) {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                self.warn(
                    WarningKind::BadNode,
                    format!("inode {inum}: bad encryption context: {e}"),
                );
                None
            }
        }
    }

    /// Per-file key for `ctx`, if a matching master key is configured.
    fn key_for(&mut self, ctx: &EncryptionContext, what: &str) -> Option<FileKey> {
        let Some(master) = self.options.master_key.as_ref() else {
            return None;
        };

        match FileKey::derive(master, ctx) {
            Ok(key) => Some(key),
            Err(e) => {
                self.warn(WarningKind::KeyMismatch, format!("{what}: {e}"));
                None
            }
        }
    }

    fn file_key(&mut self, inum: u64, path: &str) -> Option<FileKey> {
        let ctx = self.context_of(inum)?;
        self.key_for(&ctx, path)
    }

    /// Flags xattr entries whose value inode never materialised.
    fn check_xattrs(&mut self, inum: u64, path: &str) {
        let Some(entry) = self.inodes.get(&inum) else {
            return;
        };

        let orphans: Vec<u64> = entry
            .xents
            .iter()
            .filter(|x| {
                self.inodes
                    .get(&x.node.inum())
                    .and_then(|e| e.ino.as_ref())
                    .is_none()
            })
            .map(|x| x.node.inum())
            .collect();

        for orphan in orphans {
            self.warn(
                WarningKind::OrphanInode,
                format!("{path}: xattr value inode {orphan} is missing"),
            );
        }
    }
}

/// Reads the packed device number out of an inode's inline data.
fn packed_dev(inline: &[u8]) -> Option<u64> {
    match inline.len() {
        4 => Some(u64::from(u32::from_le_bytes(inline.try_into().unwrap()))),
        8 => Some(u64::from_le_bytes(inline.try_into().unwrap())),
        _ => None,
    }
}

/// Splits a packed device number into major and minor, per the kernel's
/// `new_decode_dev` (the 8-byte "huge" encoding widens the same fields).
fn decode_dev(dev: u64) -> (u32, u32) {
    let major = ((dev >> 8) & 0xFFF) as u32;
    let minor = ((dev & 0xFF) | ((dev >> 12) & 0xFFF_FF00)) as u32;
    (major, minor)
}
