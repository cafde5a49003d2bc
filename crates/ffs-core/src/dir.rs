//! Directory operations over whole directories: iteration, lookup, link,
//! unlink, mkdir and expansion.

use crate::{Filesystem, FfsError, Result};
use ffs_dir::{
    DirAction, DirEntry, IterFlags, LinkRequest, UnlinkRequest, init_dir_block, init_empty_block,
    iterate_block,
};
use ffs_ondisk::{Ext2Inode, FileType, IncompatFeatures};
use ffs_types::{BlockNumber, EXT2_INDEX_FL, InodeNumber, S_IFDIR};
use tracing::{debug, trace};

impl Filesystem {
    fn filetype_enabled(&self) -> bool {
        self.sb.has_incompat(IncompatFeatures::FILETYPE)
    }

    /// Visit the records of every data block of directory `dir`.
    ///
    /// The callback gets the physical block, the decoded entry and the
    /// block buffer. Blocks the callback changed are written back, which
    /// needs a writable handle. A corrupt block stops the walk with
    /// `DirectoryCorrupted` and is not written.
    pub fn dir_iterate<F>(&self, dir: InodeNumber, flags: IterFlags, mut visit: F) -> Result<()>
    where
        F: FnMut(BlockNumber, &DirEntry, &mut [u8]) -> Result<DirAction>,
    {
        let inode = self.read_inode(dir)?;
        if !inode.is_dir() {
            return Err(FfsError::NotDirectory);
        }
        for (lblk, pblk) in self.data_blocks(&inode)? {
            let mut buf = self.dev.read_block(pblk)?.into_inner();
            let walk = iterate_block(&mut buf, pblk.0, lblk == 0, flags, |entry, block| {
                visit(pblk, entry, block)
            })?;
            if walk.changed {
                self.require_rw()?;
                self.dev.write_block(pblk, &buf)?;
                trace!(dir = dir.0, block = pblk.0, "rewrote directory block");
            }
            if walk.aborted {
                break;
            }
        }
        Ok(())
    }

    /// Inode of the live entry `name` in `dir`.
    pub fn lookup(&self, dir: InodeNumber, name: &[u8]) -> Result<InodeNumber> {
        let mut found = None;
        self.dir_iterate(dir, IterFlags::NONE, |_, entry, _| {
            if entry.name == name {
                found = Some(InodeNumber(entry.inode));
                return Ok(DirAction::ABORT);
            }
            Ok(DirAction::CONTINUE)
        })?;
        found.ok_or_else(|| FfsError::NotFound(String::from_utf8_lossy(name).into_owned()))
    }

    /// Add `name -> ino` to `dir`.
    ///
    /// Fails with `DirectoryFull` when no block has room; grow the
    /// directory with [`Filesystem::expand_dir`] and retry. A successful
    /// insert clears the hashed-index flag of `dir`.
    pub fn link(&mut self, dir: InodeNumber, name: &[u8], ino: InodeNumber, file_type: FileType) -> Result<()> {
        self.require_rw()?;
        let raw_type = if self.filetype_enabled() {
            file_type.as_raw()
        } else {
            0
        };
        let mut request = LinkRequest::new(name, ino.0, raw_type)?;
        self.dir_iterate(dir, IterFlags::INCLUDE_EMPTY, |blk, entry, block| {
            request.set_block(blk.0);
            request.visit(entry, block)
        })?;
        if !request.done() {
            return Err(FfsError::DirectoryFull);
        }

        let mut inode = self.read_inode(dir)?;
        if inode.flags & EXT2_INDEX_FL != 0 {
            inode.flags &= !EXT2_INDEX_FL;
            self.write_inode(dir, &inode)?;
        }
        debug!(dir = dir.0, ino = ino.0, name = %String::from_utf8_lossy(name), "linked");
        Ok(())
    }

    /// Remove the live entry `name` from `dir`, optionally only when it
    /// points at `ino`. Returns the inode the entry referenced.
    pub fn unlink(&mut self, dir: InodeNumber, name: &[u8], ino: Option<InodeNumber>) -> Result<InodeNumber> {
        self.require_rw()?;
        let mut request = UnlinkRequest::new(name, ino.map(|i| i.0));
        self.dir_iterate(dir, IterFlags::INCLUDE_EMPTY, |_, entry, block| {
            request.visit(entry, block)
        })?;
        let removed = request
            .removed()
            .ok_or_else(|| FfsError::NotFound(String::from_utf8_lossy(name).into_owned()))?;
        debug!(dir = dir.0, ino = removed, name = %String::from_utf8_lossy(name), "unlinked");
        Ok(InodeNumber(removed))
    }

    /// Create a directory under `parent`.
    ///
    /// `inum` picks the inode (a new one is allocated otherwise). With
    /// `name` the directory is linked into `parent`; `parent == inum`
    /// makes a root. Returns the new directory's inode.
    pub fn mkdir(
        &mut self,
        parent: InodeNumber,
        inum: Option<InodeNumber>,
        name: Option<&[u8]>,
    ) -> Result<InodeNumber> {
        self.require_rw()?;
        let ino = match inum {
            Some(ino) => ino,
            None => self.new_inode(parent)?,
        };
        let blk = self.new_block(BlockNumber(0))?;

        let bs = self.layout.block_size;
        let mut block = vec![0_u8; bs as usize];
        init_dir_block(&mut block, ino.0, parent.0, self.filetype_enabled())?;

        let now = self.now();
        let mut inode = Ext2Inode {
            mode: S_IFDIR | (0o777 & !self.umask),
            size: bs,
            atime: now,
            ctime: now,
            mtime: now,
            links_count: 2,
            blocks: bs / 512,
            ..Ext2Inode::default()
        };
        inode.block[0] = blk.0;

        self.dev.write_block(blk, &block)?;
        self.write_new_inode(ino, &inode)?;

        if let Some(name) = name {
            match self.lookup(parent, name) {
                Ok(_) => return Err(FfsError::Exists),
                Err(FfsError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
            self.link(parent, name, ino, FileType::Dir)?;
        }

        // Read after linking: link may have rewritten the parent's flags.
        if parent != ino {
            let mut parent_inode = self.read_inode(parent)?;
            parent_inode.links_count = parent_inode.links_count.saturating_add(1);
            self.write_inode(parent, &parent_inode)?;
        }

        self.block_alloc_stats(blk, 1)?;
        self.inode_alloc_stats(ino, 1, true)?;
        debug!(parent = parent.0, ino = ino.0, block = blk.0, "created directory");
        Ok(ino)
    }

    /// Append one empty block to directory `dir`; returns the new block.
    pub fn expand_dir(&mut self, dir: InodeNumber) -> Result<BlockNumber> {
        self.require_rw()?;
        let mut inode = self.read_inode(dir)?;
        if !inode.is_dir() {
            return Err(FfsError::NotDirectory);
        }
        let last = self.data_blocks(&inode)?.last().copied();
        let (next_lblk, goal) = last.map_or((0, BlockNumber(0)), |(lblk, pblk)| (lblk + 1, pblk));

        let blk = self.new_block(goal)?;
        let bs = self.layout.block_size;
        let mut block = vec![0_u8; bs as usize];
        init_empty_block(&mut block)?;
        self.dev.write_block(blk, &block)?;
        self.block_alloc_stats(blk, 1)?;

        self.set_data_block(&mut inode, next_lblk, blk)?;
        inode.size += bs;
        inode.blocks += bs / 512;
        self.write_inode(dir, &inode)?;
        debug!(dir = dir.0, block = blk.0, lblk = next_lblk, "expanded directory");
        Ok(blk)
    }
}
