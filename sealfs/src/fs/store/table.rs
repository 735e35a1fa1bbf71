use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, error, warn};

use crate::fs::errors::FsError;
use crate::fs::inode::{
    DataId, FIRST_DATA_ID, FIRST_INODE_ID, INVALID_INODE, Inode, InodeAttrs, InodeData, InodeId,
    InodeKind, MAX_DATA_ID, MAX_INODE_ID, ROOT_INODE_ID,
};
use crate::fs::types::{FsStats, Timestamp};
use crate::fs::validate_filename;

/// An entry detached from the table.
#[derive(Debug, Clone)]
pub struct Removed {
    pub inode: Inode,
    /// Set when the entry held the last reference to its data blob.
    pub released_blob: Option<DataId>,
}

/// The complete structural state: every inode, keyed by id, plus the
/// allocation counters. Blob reference counts are derived, never persisted.
#[derive(Debug, Clone)]
pub struct InodeTable {
    inodes: HashMap<InodeId, Inode>,
    next_inode_id: InodeId,
    next_data_id: DataId,
    data_refs: HashMap<DataId, u32>,
}

fn new_root(uid: u32, gid: u32) -> Inode {
    Inode {
        id: ROOT_INODE_ID,
        parent: INVALID_INODE,
        name: String::new(),
        attrs: InodeAttrs::new(InodeKind::Dir, 0o777, uid, gid),
        data: InodeData::Dir {
            children: HashMap::new(),
        },
    }
}

impl InodeTable {
    /// A table holding only an empty root directory.
    pub fn bootstrap(uid: u32, gid: u32) -> Self {
        Self {
            inodes: HashMap::from([(ROOT_INODE_ID, new_root(uid, gid))]),
            next_inode_id: FIRST_INODE_ID,
            next_data_id: FIRST_DATA_ID,
            data_refs: HashMap::new(),
        }
    }

    /// Rebuilds a table from loaded entries, repairing what it can.
    ///
    /// Counters end up strictly above every id and data id present, and
    /// never below the recorded hints. Ids outside the allocatable range
    /// are treated as corrupt entries and dropped.
    pub fn from_inodes(
        mut inodes: HashMap<InodeId, Inode>,
        next_inode_hint: InodeId,
        next_data_hint: DataId,
        owner: (u32, u32),
    ) -> Self {
        inodes.retain(|id, inode| {
            let data_ok = inode.data_id().is_none_or(|d| d <= MAX_DATA_ID);
            if *id > MAX_INODE_ID || !data_ok {
                warn!("Dropping inode {} with an out-of-range id", id);
                return false;
            }
            if inode.id != *id {
                warn!("Inode keyed {} records id {}; using key", id, inode.id);
                inode.id = *id;
            }
            true
        });

        match inodes.get(&ROOT_INODE_ID) {
            Some(root) if root.is_directory() => {}
            Some(_) => {
                error!("Root inode {} is not a directory; replacing it", ROOT_INODE_ID);
                inodes.insert(ROOT_INODE_ID, new_root(owner.0, owner.1));
            }
            None => {
                warn!("Snapshot has no root inode; creating one");
                inodes.insert(ROOT_INODE_ID, new_root(owner.0, owner.1));
            }
        }
        if let Some(root) = inodes.get_mut(&ROOT_INODE_ID) {
            root.parent = INVALID_INODE;
            root.name.clear();
        }

        let mut table = Self {
            inodes,
            next_inode_id: FIRST_INODE_ID,
            next_data_id: FIRST_DATA_ID,
            data_refs: HashMap::new(),
        };
        table.repair_links();

        if next_inode_hint > MAX_INODE_ID + 1 {
            warn!("Ignoring out-of-range next_inode_id {}", next_inode_hint);
        }
        if next_data_hint > MAX_DATA_ID + 1 {
            warn!("Ignoring out-of-range next_data_id {}", next_data_hint);
        }
        let next_inode_hint = next_inode_hint.min(MAX_INODE_ID + 1);
        let next_data_hint = next_data_hint.min(MAX_DATA_ID + 1);

        let max_id = table.inodes.keys().copied().max().unwrap_or(ROOT_INODE_ID);
        table.next_inode_id = next_inode_hint.max(max_id + 1).max(FIRST_INODE_ID);

        for data_id in table.inodes.values().filter_map(Inode::data_id) {
            *table.data_refs.entry(data_id).or_default() += 1;
        }
        let max_data = table.data_refs.keys().copied().max();
        table.next_data_id = match max_data {
            Some(max) => next_data_hint.max(max + 1),
            None => next_data_hint,
        }
        .max(FIRST_DATA_ID);

        table
    }

    /// Keeps exactly what a walk from the root reaches. Links to missing
    /// inodes, to the root, or to an inode already reached are dropped, as
    /// is every inode the walk never visits (including detached cycles).
    fn repair_links(&mut self) {
        let mut visited = HashSet::from([ROOT_INODE_ID]);
        let mut queue = VecDeque::from([ROOT_INODE_ID]);
        let mut links = Vec::new();
        let mut dangling = Vec::new();

        while let Some(dir_id) = queue.pop_front() {
            let Some(children) = self.inodes.get(&dir_id).and_then(Inode::children) else {
                continue;
            };
            let mut names: Vec<_> = children.iter().collect();
            names.sort_unstable();
            for (name, child) in names {
                if !self.inodes.contains_key(child) {
                    dangling.push((dir_id, name.clone()));
                } else if !visited.insert(*child) {
                    warn!("Inode {} is linked more than once", child);
                    dangling.push((dir_id, name.clone()));
                } else {
                    links.push((*child, dir_id, name.clone()));
                    queue.push_back(*child);
                }
            }
        }

        for (dir_id, name) in dangling {
            warn!("Dropping dangling entry {:?} from directory {}", name, dir_id);
            if let Some(children) = self.inodes.get_mut(&dir_id).and_then(Inode::children_mut) {
                children.remove(&name);
            }
        }

        for (id, parent, name) in links {
            if let Some(inode) = self.inodes.get_mut(&id)
                && (inode.parent != parent || inode.name != name)
            {
                warn!(
                    "Inode {} records parent {} name {:?}; fixing to {} {:?}",
                    id, inode.parent, inode.name, parent, name
                );
                inode.parent = parent;
                inode.name = name;
            }
        }

        self.inodes.retain(|id, _| {
            let reachable = visited.contains(id);
            if !reachable {
                warn!("Inode {} is unreachable from the root; dropping it", id);
            }
            reachable
        });
    }

    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    pub fn inodes(&self) -> impl Iterator<Item = &Inode> {
        self.inodes.values()
    }

    pub fn next_inode_id(&self) -> InodeId {
        self.next_inode_id
    }

    pub fn next_data_id(&self) -> DataId {
        self.next_data_id
    }

    fn allocate_inode_id(&mut self) -> Result<InodeId, FsError> {
        let id = self.next_inode_id;
        if id > MAX_INODE_ID {
            error!("Inode ids exhausted");
            return Err(FsError::NoSpace);
        }
        self.next_inode_id = id + 1;
        Ok(id)
    }

    pub fn allocate_data_id(&mut self) -> Result<DataId, FsError> {
        let id = self.next_data_id;
        if id > MAX_DATA_ID {
            error!("Data ids exhausted");
            return Err(FsError::NoSpace);
        }
        self.next_data_id = id + 1;
        Ok(id)
    }

    pub fn data_refs(&self, data_id: DataId) -> u32 {
        self.data_refs.get(&data_id).copied().unwrap_or(0)
    }

    pub fn referenced_data_ids(&self) -> impl Iterator<Item = DataId> + '_ {
        self.data_refs.keys().copied()
    }

    fn retain_blob(&mut self, data_id: DataId) {
        *self.data_refs.entry(data_id).or_default() += 1;
    }

    /// Drops one reference; returns the id if that was the last one.
    fn release_blob(&mut self, data_id: DataId) -> Option<DataId> {
        match self.data_refs.get_mut(&data_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                None
            }
            Some(_) => {
                self.data_refs.remove(&data_id);
                Some(data_id)
            }
            None => {
                warn!("Releasing untracked blob {}", data_id);
                Some(data_id)
            }
        }
    }

    /// Resolves `name` inside `parent`. `(INVALID_INODE, "")` names the root.
    pub fn lookup(&self, parent: InodeId, name: &str) -> Option<InodeId> {
        if parent == INVALID_INODE {
            return name.is_empty().then_some(ROOT_INODE_ID);
        }
        self.inodes.get(&parent)?.children()?.get(name).copied()
    }

    pub fn get(&self, id: InodeId) -> Option<&Inode> {
        self.inodes.get(&id)
    }

    pub fn get_mut(&mut self, id: InodeId) -> Option<&mut Inode> {
        self.inodes.get_mut(&id)
    }

    pub fn get_child(&self, parent: InodeId, name: &str) -> Option<&Inode> {
        self.lookup(parent, name).and_then(|id| self.get(id))
    }

    pub fn children(&self, dir_id: InodeId) -> Option<&HashMap<String, InodeId>> {
        self.inodes.get(&dir_id)?.children()
    }

    pub fn parent(&self, id: InodeId) -> InodeId {
        self.inodes
            .get(&id)
            .map(|inode| inode.parent)
            .unwrap_or(INVALID_INODE)
    }

    fn directory_mut(&mut self, id: InodeId) -> Result<&mut Inode, FsError> {
        match self.inodes.get_mut(&id) {
            Some(inode) if inode.is_directory() => Ok(inode),
            Some(_) => Err(FsError::NotDirectory),
            None => Err(FsError::NotFound),
        }
    }

    fn check_new_child(&self, parent: InodeId, name: &str) -> Result<(), FsError> {
        validate_filename(name)?;
        match self.inodes.get(&parent) {
            Some(dir) => match dir.children() {
                Some(children) if children.contains_key(name) => Err(FsError::Exists),
                Some(_) => Ok(()),
                None => Err(FsError::NotDirectory),
            },
            None => Err(FsError::NotFound),
        }
    }

    fn link_child(&mut self, parent: InodeId, name: &str, child: InodeId, is_dir: bool) {
        let now = Timestamp::now();
        if let Ok(dir) = self.directory_mut(parent) {
            if let Some(children) = dir.children_mut() {
                children.insert(name.to_string(), child);
            }
            if is_dir {
                dir.attrs.nlink += 1;
            }
            dir.attrs.mtime = now;
            dir.attrs.ctime = now;
        }
    }

    fn unlink_child(&mut self, parent: InodeId, name: &str, is_dir: bool) {
        let now = Timestamp::now();
        if let Ok(dir) = self.directory_mut(parent) {
            if let Some(children) = dir.children_mut() {
                children.remove(name);
            }
            if is_dir {
                dir.attrs.nlink = dir.attrs.nlink.saturating_sub(1).max(2);
            }
            dir.attrs.mtime = now;
            dir.attrs.ctime = now;
        }
    }

    /// Creates a file or directory under `parent`. Files get a fresh data
    /// id; the caller is responsible for materializing the blob.
    pub fn create(
        &mut self,
        parent: InodeId,
        name: &str,
        kind: InodeKind,
        mode: u32,
        owner: (u32, u32),
    ) -> Result<Inode, FsError> {
        self.check_new_child(parent, name)?;

        let id = self.allocate_inode_id()?;
        let data = match kind {
            InodeKind::File => {
                let data_id = self.allocate_data_id()?;
                self.retain_blob(data_id);
                InodeData::File { data_id }
            }
            InodeKind::Dir => InodeData::Dir {
                children: HashMap::new(),
            },
        };

        let inode = Inode {
            id,
            parent,
            name: name.to_string(),
            attrs: InodeAttrs::new(kind, mode, owner.0, owner.1),
            data,
        };
        debug!("Allocated inode {} ({:?}) for {:?} in {}", id, kind, name, parent);

        self.inodes.insert(id, inode.clone());
        self.link_child(parent, name, id, kind == InodeKind::Dir);
        Ok(inode)
    }

    /// Creates a file entry sharing `source`'s data blob. No bytes are copied.
    pub fn cow_alias(
        &mut self,
        parent: InodeId,
        name: &str,
        mode: u32,
        source: InodeId,
        owner: (u32, u32),
    ) -> Result<Inode, FsError> {
        let (data_id, size, mtime) = match self.inodes.get(&source) {
            Some(src) => match src.data {
                InodeData::File { data_id } => (data_id, src.attrs.size, src.attrs.mtime),
                InodeData::Dir { .. } => return Err(FsError::IsDirectory),
            },
            None => return Err(FsError::NotFound),
        };
        self.check_new_child(parent, name)?;

        let id = self.allocate_inode_id()?;
        let mut attrs = InodeAttrs::new(InodeKind::File, mode, owner.0, owner.1);
        attrs.size = size;
        attrs.mtime = mtime;

        let inode = Inode {
            id,
            parent,
            name: name.to_string(),
            attrs,
            data: InodeData::File { data_id },
        };
        debug!("Aliased inode {} onto blob {} of inode {}", id, data_id, source);

        self.retain_blob(data_id);
        self.inodes.insert(id, inode.clone());
        self.link_child(parent, name, id, false);
        Ok(inode)
    }

    /// Detaches and erases `id`, which must be of `expected` kind; a
    /// directory must be empty.
    pub fn remove(&mut self, id: InodeId, expected: InodeKind) -> Result<Removed, FsError> {
        let inode = self.inodes.get(&id).ok_or(FsError::NotFound)?;
        if id == ROOT_INODE_ID {
            return Err(FsError::OperationNotPermitted);
        }
        match (&inode.data, expected) {
            (InodeData::File { .. }, InodeKind::Dir) => return Err(FsError::NotDirectory),
            (InodeData::Dir { .. }, InodeKind::File) => return Err(FsError::IsDirectory),
            (InodeData::Dir { children }, InodeKind::Dir) if !children.is_empty() => {
                return Err(FsError::NotEmpty);
            }
            _ => {}
        }

        let Some(inode) = self.inodes.remove(&id) else {
            return Err(FsError::NotFound);
        };
        self.unlink_child(inode.parent, &inode.name, inode.is_directory());

        let released_blob = inode.data_id().and_then(|d| self.release_blob(d));
        Ok(Removed {
            inode,
            released_blob,
        })
    }

    pub fn is_ancestor_of(&self, ancestor: InodeId, mut id: InodeId) -> bool {
        while id != INVALID_INODE {
            if id == ancestor {
                return true;
            }
            id = self.parent(id);
        }
        false
    }

    /// Moves `parent/name` to `new_parent/new_name`, replacing a compatible
    /// target. Returns the replaced entry, if any.
    pub fn rename(
        &mut self,
        parent: InodeId,
        name: &str,
        new_parent: InodeId,
        new_name: &str,
    ) -> Result<Option<Removed>, FsError> {
        validate_filename(new_name)?;
        if self.children(parent).is_none() {
            return Err(match self.get(parent) {
                Some(_) => FsError::NotDirectory,
                None => FsError::NotFound,
            });
        }
        let id = self.lookup(parent, name).ok_or(FsError::NotFound)?;
        self.directory_mut(new_parent)?;

        let moving_kind = self.inodes[&id].kind();
        if moving_kind == InodeKind::Dir && self.is_ancestor_of(id, new_parent) {
            return Err(FsError::InvalidArgument);
        }

        let mut replaced = None;
        if let Some(target) = self.lookup(new_parent, new_name) {
            if target == id {
                return Ok(None);
            }
            let target_kind = self.inodes[&target].kind();
            match (moving_kind, target_kind) {
                (InodeKind::Dir, InodeKind::File) => return Err(FsError::NotDirectory),
                (InodeKind::File, InodeKind::Dir) => return Err(FsError::IsDirectory),
                _ => {}
            }
            replaced = Some(self.remove(target, target_kind)?);
        }

        let is_dir = moving_kind == InodeKind::Dir;
        self.unlink_child(parent, name, is_dir);
        self.link_child(new_parent, new_name, id, is_dir);

        if let Some(inode) = self.inodes.get_mut(&id) {
            inode.parent = new_parent;
            inode.name = new_name.to_string();
            inode.attrs.ctime = Timestamp::now();
        }
        Ok(replaced)
    }

    /// Points `id` at a different blob. Returns the old blob if it lost its
    /// last reference.
    pub fn rebind_data(&mut self, id: InodeId, new_data: DataId) -> Result<Option<DataId>, FsError> {
        let old = match self.inodes.get_mut(&id) {
            Some(Inode {
                data: InodeData::File { data_id },
                ..
            }) => std::mem::replace(data_id, new_data),
            Some(_) => return Err(FsError::IsDirectory),
            None => return Err(FsError::NotFound),
        };
        self.retain_blob(new_data);
        Ok(self.release_blob(old))
    }

    pub fn stats(&self) -> FsStats {
        let mut stats = FsStats {
            inodes: self.inodes.len() as u64,
            files: 0,
            directories: 0,
            used_bytes: 0,
        };
        for inode in self.inodes.values() {
            if inode.is_directory() {
                stats.directories += 1;
            } else {
                stats.files += 1;
            }
        }
        // Aliased blobs are counted once.
        let mut seen = std::collections::HashSet::new();
        for inode in self.inodes.values() {
            if let Some(data_id) = inode.data_id()
                && seen.insert(data_id)
            {
                stats.used_bytes += inode.attrs.size;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: (u32, u32) = (1000, 1000);

    fn table() -> InodeTable {
        InodeTable::bootstrap(0, 0)
    }

    #[test]
    fn test_bootstrap_has_single_root() {
        let table = table();
        let roots: Vec<_> = table
            .inodes()
            .filter(|i| i.parent == INVALID_INODE)
            .collect();
        assert_eq!(roots.len(), 1);
        assert!(roots[0].is_directory());
        assert_eq!(table.lookup(INVALID_INODE, ""), Some(ROOT_INODE_ID));
        assert_eq!(table.lookup(INVALID_INODE, "x"), None);
        assert_eq!(table.parent(ROOT_INODE_ID), INVALID_INODE);
    }

    #[test]
    fn test_create_lookup_round_trip() {
        let mut table = table();
        let dir = table
            .create(ROOT_INODE_ID, "docs", InodeKind::Dir, 0o755, OWNER)
            .unwrap();
        for name in ["a", "b.txt", "with space", "ünïcode"] {
            let file = table
                .create(dir.id, name, InodeKind::File, 0o644, OWNER)
                .unwrap();
            assert_eq!(file.parent, dir.id);
            assert_eq!(table.lookup(dir.id, name), Some(file.id));
            assert_eq!(table.get_child(dir.id, name).map(|i| i.id), Some(file.id));
            assert_eq!(table.parent(file.id), dir.id);
        }
        assert_eq!(table.children(dir.id).unwrap().len(), 4);
        assert_eq!(table.get(ROOT_INODE_ID).unwrap().attrs.nlink, 3);
    }

    #[test]
    fn test_create_sets_attributes() {
        let mut table = table();
        let file = table
            .create(ROOT_INODE_ID, "f", InodeKind::File, 0o104755, OWNER)
            .unwrap();
        assert_eq!(file.attrs.mode, 0o100755);
        assert_eq!(file.attrs.size, 0);
        assert_eq!(file.attrs.nlink, 1);
        assert_eq!((file.uid(), file.gid()), OWNER);
        assert_eq!(file.attrs.atime, file.attrs.mtime);
        assert!(file.data_id().is_some());

        let dir = table
            .create(ROOT_INODE_ID, "d", InodeKind::Dir, 0o700, OWNER)
            .unwrap();
        assert_eq!(dir.attrs.mode, 0o040700);
        assert_eq!(dir.attrs.nlink, 2);
        assert!(dir.children().unwrap().is_empty());
    }

    #[test]
    fn test_create_rejects_bad_parent_and_duplicates() {
        let mut table = table();
        let file = table
            .create(ROOT_INODE_ID, "f", InodeKind::File, 0o644, OWNER)
            .unwrap();

        assert_eq!(
            table.create(file.id, "x", InodeKind::File, 0o644, OWNER).unwrap_err(),
            FsError::NotDirectory
        );
        assert_eq!(
            table.create(999, "x", InodeKind::File, 0o644, OWNER).unwrap_err(),
            FsError::NotFound
        );
        assert_eq!(
            table
                .create(ROOT_INODE_ID, "f", InodeKind::Dir, 0o755, OWNER)
                .unwrap_err(),
            FsError::Exists
        );
        assert_eq!(table.lookup(ROOT_INODE_ID, "f"), Some(file.id));
    }

    #[test]
    fn test_allocation_is_monotonic() {
        let mut table = table();
        let mut ids = Vec::new();
        for i in 0..10 {
            let inode = table
                .create(ROOT_INODE_ID, &format!("f{i}"), InodeKind::File, 0o644, OWNER)
                .unwrap();
            ids.push(inode.id);
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert!(ids.iter().all(|id| *id < table.next_inode_id()));
        assert!(ids.iter().all(|id| *id != ROOT_INODE_ID));

        let last = *ids.last().unwrap();
        table.remove(last, InodeKind::File).unwrap();
        let next = table
            .create(ROOT_INODE_ID, "again", InodeKind::File, 0o644, OWNER)
            .unwrap();
        assert!(next.id > last);
    }

    #[test]
    fn test_remove_non_empty_directory() {
        let mut table = table();
        let dir = table
            .create(ROOT_INODE_ID, "d", InodeKind::Dir, 0o755, OWNER)
            .unwrap();
        let file = table
            .create(dir.id, "f", InodeKind::File, 0o644, OWNER)
            .unwrap();

        assert_eq!(
            table.remove(dir.id, InodeKind::Dir).unwrap_err(),
            FsError::NotEmpty
        );
        assert!(table.get(dir.id).is_some());

        table.remove(file.id, InodeKind::File).unwrap();
        table.remove(dir.id, InodeKind::Dir).unwrap();
        assert!(table.get(dir.id).is_none());
        assert_eq!(table.lookup(ROOT_INODE_ID, "d"), None);
        assert_eq!(table.get(ROOT_INODE_ID).unwrap().attrs.nlink, 2);
    }

    #[test]
    fn test_remove_kind_mismatch_and_root() {
        let mut table = table();
        let file = table
            .create(ROOT_INODE_ID, "f", InodeKind::File, 0o644, OWNER)
            .unwrap();
        assert_eq!(
            table.remove(file.id, InodeKind::Dir).unwrap_err(),
            FsError::NotDirectory
        );
        assert_eq!(
            table.remove(ROOT_INODE_ID, InodeKind::File).unwrap_err(),
            FsError::OperationNotPermitted
        );
        assert_eq!(
            table.remove(12345, InodeKind::File).unwrap_err(),
            FsError::NotFound
        );
    }

    #[test]
    fn test_cow_alias_shares_blob() {
        let mut table = table();
        let source = table
            .create(ROOT_INODE_ID, "src", InodeKind::File, 0o644, OWNER)
            .unwrap();
        let mtime = source.attrs.mtime;
        table.get_mut(source.id).unwrap().attrs.size = 77;

        let alias = table
            .cow_alias(ROOT_INODE_ID, "copy", 0o600, source.id, OWNER)
            .unwrap();
        assert_ne!(alias.id, source.id);
        assert_eq!(alias.data_id(), source.data_id());
        assert_eq!(alias.attrs.size, 77);
        assert_eq!(alias.attrs.mtime, mtime);
        assert_eq!(alias.attrs.mode & 0o777, 0o600);

        let data_id = source.data_id().unwrap();
        assert_eq!(table.data_refs(data_id), 2);

        let removed = table.remove(source.id, InodeKind::File).unwrap();
        assert_eq!(removed.released_blob, None);
        let removed = table.remove(alias.id, InodeKind::File).unwrap();
        assert_eq!(removed.released_blob, Some(data_id));
    }

    #[test]
    fn test_cow_alias_rejects_directories() {
        let mut table = table();
        let dir = table
            .create(ROOT_INODE_ID, "d", InodeKind::Dir, 0o755, OWNER)
            .unwrap();
        let file = table
            .create(ROOT_INODE_ID, "f", InodeKind::File, 0o644, OWNER)
            .unwrap();

        assert_eq!(
            table
                .cow_alias(ROOT_INODE_ID, "x", 0o644, dir.id, OWNER)
                .unwrap_err(),
            FsError::IsDirectory
        );
        assert_eq!(
            table
                .cow_alias(file.id, "x", 0o644, file.id, OWNER)
                .unwrap_err(),
            FsError::NotDirectory
        );
    }

    #[test]
    fn test_rename_moves_and_replaces() {
        let mut table = table();
        let a = table
            .create(ROOT_INODE_ID, "a", InodeKind::Dir, 0o755, OWNER)
            .unwrap();
        let f = table
            .create(ROOT_INODE_ID, "f", InodeKind::File, 0o644, OWNER)
            .unwrap();
        let g = table
            .create(a.id, "g", InodeKind::File, 0o644, OWNER)
            .unwrap();

        let replaced = table.rename(ROOT_INODE_ID, "f", a.id, "g").unwrap();
        let replaced = replaced.unwrap();
        assert_eq!(replaced.inode.id, g.id);
        assert_eq!(replaced.released_blob, g.data_id());

        assert_eq!(table.lookup(ROOT_INODE_ID, "f"), None);
        assert_eq!(table.lookup(a.id, "g"), Some(f.id));
        let moved = table.get(f.id).unwrap();
        assert_eq!((moved.parent, moved.name.as_str()), (a.id, "g"));
    }

    #[test]
    fn test_rename_directory_into_itself() {
        let mut table = table();
        let a = table
            .create(ROOT_INODE_ID, "a", InodeKind::Dir, 0o755, OWNER)
            .unwrap();
        let b = table
            .create(a.id, "b", InodeKind::Dir, 0o755, OWNER)
            .unwrap();
        assert_eq!(
            table.rename(ROOT_INODE_ID, "a", b.id, "a").unwrap_err(),
            FsError::InvalidArgument
        );
        assert_eq!(
            table.rename(ROOT_INODE_ID, "a", ROOT_INODE_ID, "a").unwrap().map(|r| r.inode.id),
            None
        );
    }

    #[test]
    fn test_from_inodes_repairs_and_reseeds() {
        let mut table = table();
        let dir = table
            .create(ROOT_INODE_ID, "d", InodeKind::Dir, 0o755, OWNER)
            .unwrap();
        let file = table
            .create(dir.id, "f", InodeKind::File, 0o644, OWNER)
            .unwrap();

        let mut inodes: HashMap<_, _> = table.inodes().map(|i| (i.id, i.clone())).collect();
        // A child pointing nowhere and an entry nobody links to.
        inodes
            .get_mut(&dir.id)
            .unwrap()
            .children_mut()
            .unwrap()
            .insert("ghost".to_string(), 500);
        let mut stray = file.clone();
        stray.id = 900;
        stray.name = "stray".to_string();
        stray.data = InodeData::File { data_id: 40 };
        inodes.insert(900, stray);

        let loaded = InodeTable::from_inodes(inodes, 0, 0, OWNER);
        assert_eq!(loaded.lookup(dir.id, "ghost"), None);
        assert!(loaded.get(900).is_none());
        assert_eq!(loaded.lookup(dir.id, "f"), Some(file.id));
        assert!(loaded.next_inode_id() > file.id);
        assert!(loaded.next_data_id() > file.data_id().unwrap());
        assert_eq!(loaded.data_refs(file.data_id().unwrap()), 1);
    }

    #[test]
    fn test_from_inodes_without_root() {
        let loaded = InodeTable::from_inodes(HashMap::new(), 50, 9, OWNER);
        let root = loaded.get(ROOT_INODE_ID).unwrap();
        assert!(root.is_directory());
        assert_eq!(root.parent, INVALID_INODE);
        assert_eq!(loaded.next_inode_id(), 50);
        assert_eq!(loaded.next_data_id(), 9);
    }

    #[test]
    fn test_from_inodes_drops_detached_cycle() {
        let mut table = table();
        let kept = table
            .create(ROOT_INODE_ID, "kept", InodeKind::Dir, 0o755, OWNER)
            .unwrap();
        let mut inodes: HashMap<_, _> = table.inodes().map(|i| (i.id, i.clone())).collect();

        // 10 and 11 list each other; 12 is a file inside the loop.
        let dir = |id: InodeId, parent: InodeId, children: &[(&str, InodeId)]| Inode {
            id,
            parent,
            name: format!("d{id}"),
            attrs: InodeAttrs::new(InodeKind::Dir, 0o755, 0, 0),
            data: InodeData::Dir {
                children: children.iter().map(|(n, c)| (n.to_string(), *c)).collect(),
            },
        };
        inodes.insert(10, dir(10, 11, &[("y", 11), ("f", 12)]));
        inodes.insert(11, dir(11, 10, &[("x", 10)]));
        inodes.insert(
            12,
            Inode {
                id: 12,
                parent: 10,
                name: "f".to_string(),
                attrs: InodeAttrs::new(InodeKind::File, 0o644, 0, 0),
                data: InodeData::File { data_id: 77 },
            },
        );

        let loaded = InodeTable::from_inodes(inodes, 0, 0, OWNER);
        assert_eq!(loaded.len(), 2);
        assert!(loaded.get(kept.id).is_some());
        for id in [10, 11, 12] {
            assert!(loaded.get(id).is_none());
        }
        assert_eq!(loaded.data_refs(77), 0);
        assert!(loaded.is_ancestor_of(ROOT_INODE_ID, kept.id));
    }

    #[test]
    fn test_from_inodes_duplicate_link_keeps_one() {
        let mut table = table();
        let a = table
            .create(ROOT_INODE_ID, "a", InodeKind::Dir, 0o755, OWNER)
            .unwrap();
        let f = table
            .create(a.id, "f", InodeKind::File, 0o644, OWNER)
            .unwrap();
        let mut inodes: HashMap<_, _> = table.inodes().map(|i| (i.id, i.clone())).collect();
        inodes
            .get_mut(&ROOT_INODE_ID)
            .unwrap()
            .children_mut()
            .unwrap()
            .insert("again".to_string(), f.id);

        let loaded = InodeTable::from_inodes(inodes, 0, 0, OWNER);
        let links = [loaded.lookup(ROOT_INODE_ID, "again"), loaded.lookup(a.id, "f")];
        assert_eq!(links.iter().flatten().count(), 1);
        let kept = loaded.get(f.id).unwrap();
        assert_eq!(loaded.lookup(kept.parent, &kept.name), Some(f.id));
    }

    #[test]
    fn test_out_of_range_ids_are_rejected() {
        let root_only: HashMap<_, _> = table().inodes().map(|i| (i.id, i.clone())).collect();
        let mut loaded = InodeTable::from_inodes(root_only.clone(), u64::MAX, u64::MAX, OWNER);
        assert_eq!(loaded.next_inode_id(), MAX_INODE_ID + 1);
        assert_eq!(
            loaded.create(ROOT_INODE_ID, "x", InodeKind::File, 0o644, OWNER),
            Err(FsError::NoSpace)
        );
        assert_eq!(loaded.lookup(ROOT_INODE_ID, "x"), None);

        let mut inodes = root_only;
        let bad = Inode {
            id: INVALID_INODE,
            parent: ROOT_INODE_ID,
            name: "bad".to_string(),
            attrs: InodeAttrs::new(InodeKind::File, 0o644, 0, 0),
            data: InodeData::File { data_id: 3 },
        };
        inodes
            .get_mut(&ROOT_INODE_ID)
            .unwrap()
            .children_mut()
            .unwrap()
            .insert("bad".to_string(), INVALID_INODE);
        inodes.insert(INVALID_INODE, bad);

        let mut loaded = InodeTable::from_inodes(inodes, 0, 0, OWNER);
        assert!(loaded.get(INVALID_INODE).is_none());
        assert_eq!(loaded.lookup(ROOT_INODE_ID, "bad"), None);
        assert_eq!(loaded.next_inode_id(), FIRST_INODE_ID);
        let x = loaded
            .create(ROOT_INODE_ID, "x", InodeKind::File, 0o644, OWNER)
            .unwrap();
        assert_eq!(x.id, FIRST_INODE_ID);
    }

    #[test]
    fn test_data_ids_exhausted() {
        let root_only: HashMap<_, _> = table().inodes().map(|i| (i.id, i.clone())).collect();
        let mut loaded = InodeTable::from_inodes(root_only, 0, MAX_DATA_ID + 1, OWNER);
        assert_eq!(loaded.allocate_data_id(), Err(FsError::NoSpace));
        assert_eq!(
            loaded.create(ROOT_INODE_ID, "f", InodeKind::File, 0o644, OWNER),
            Err(FsError::NoSpace)
        );
        // Directories need no data id.
        assert!(
            loaded
                .create(ROOT_INODE_ID, "d", InodeKind::Dir, 0o755, OWNER)
                .is_ok()
        );
    }

    #[test]
    fn test_stats_count_aliases_once() {
        let mut table = table();
        let f = table
            .create(ROOT_INODE_ID, "f", InodeKind::File, 0o644, OWNER)
            .unwrap();
        table.get_mut(f.id).unwrap().attrs.size = 10;
        table
            .cow_alias(ROOT_INODE_ID, "g", 0o644, f.id, OWNER)
            .unwrap();

        let stats = table.stats();
        assert_eq!(stats.inodes, 3);
        assert_eq!(stats.files, 2);
        assert_eq!(stats.directories, 1);
        assert_eq!(stats.used_bytes, 10);
    }
}
