// The directory abstraction segments and the manifest are written through.
//
// `OsDir` is backed by a real directory. `MockDir` keeps everything in memory,
// records every operation as an `Event` so tests can assert on the exact IO a
// store performs, and can simulate a crash that discards unsynced writes.

use std::{
    cell::RefCell,
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, Write},
    path::{Path, PathBuf},
    rc::Rc,
};

use anyhow::bail;

pub trait DbFile: std::fmt::Debug + Read + Seek {
    fn write(&mut self, buf: &[u8]) -> anyhow::Result<()>;
    fn sync(&mut self) -> anyhow::Result<()>;
    fn len(&self) -> anyhow::Result<u64>;
}

pub trait DbDir: Clone {
    type DbFile: DbFile;

    fn cd<P>(&mut self, dir_name: &P) -> anyhow::Result<Self>
    where
        P: AsRef<Path>;

    fn unlink<P>(&mut self, fname: &P) -> anyhow::Result<bool>
    where
        P: AsRef<Path>;

    fn ls(&mut self) -> anyhow::Result<Vec<String>>;

    /// Returns `None` if the file already exists.
    fn create<P>(&mut self, fname: &P) -> anyhow::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>;

    /// Returns `None` if the file does not exist.
    fn open<P>(&mut self, fname: &P) -> anyhow::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>;

    fn rename<P, Q>(&mut self, from: &P, to: &Q) -> anyhow::Result<()>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>;
}

/// Reads a whole file.
pub fn read_to_end<F: DbFile>(file: &mut F) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    file.seek(io::SeekFrom::Start(0))?;
    file.read_to_end(&mut out)?;
    Ok(out)
}

// Real directory.

#[derive(Debug)]
pub struct OsFile(File);

impl Read for OsFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Seek for OsFile {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        self.0.seek(pos)
    }
}

impl DbFile for OsFile {
    fn write(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        self.0.write_all(buf)?;
        Ok(())
    }

    fn sync(&mut self) -> anyhow::Result<()> {
        self.0.flush()?;
        self.0.sync_all()?;
        Ok(())
    }

    fn len(&self) -> anyhow::Result<u64> {
        Ok(self.0.metadata()?.len())
    }
}

#[derive(Clone, Debug)]
pub struct OsDir {
    root: PathBuf,
}

impl OsDir {
    /// Creates the directory if needed.
    pub fn new<P: Into<PathBuf>>(root: P) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(OsDir { root })
    }
}

impl DbDir for OsDir {
    type DbFile = OsFile;

    fn cd<P>(&mut self, dir_name: &P) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        OsDir::new(self.root.join(dir_name))
    }

    fn unlink<P>(&mut self, fname: &P) -> anyhow::Result<bool>
    where
        P: AsRef<Path>,
    {
        match fs::remove_file(self.root.join(fname)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn ls(&mut self) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn create<P>(&mut self, fname: &P) -> anyhow::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>,
    {
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.root.join(fname))
        {
            Ok(f) => Ok(Some(OsFile(f))),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn open<P>(&mut self, fname: &P) -> anyhow::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>,
    {
        match File::open(self.root.join(fname)) {
            Ok(f) => Ok(Some(OsFile(f))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn rename<P, Q>(&mut self, from: &P, to: &Q) -> anyhow::Result<()>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        fs::rename(self.root.join(from), self.root.join(to))?;
        Ok(())
    }
}

// In-memory directory.

type FileId = usize;

// Reads see every write. A crash rolls a file back to what was last synced.
#[derive(Default, Debug)]
struct MockData {
    synced: Vec<u8>,
    unsynced: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct MockFile {
    fs: Rc<RefCell<MockFs>>,
    id: FileId,
    pos: usize,
}

impl MockFile {
    #[cfg(test)]
    fn read_all_synced(&self) -> Vec<u8> {
        self.fs.borrow().data[self.id].synced.clone()
    }
}

fn invalid_seek() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative position")
}

impl Seek for MockFile {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let (base, delta) = match pos {
            io::SeekFrom::Start(i) => (0, i64::try_from(i).map_err(|_| invalid_seek())?),
            io::SeekFrom::End(delta) => (self.fs.borrow().data[self.id].unsynced.len(), delta),
            io::SeekFrom::Current(delta) => (self.pos, delta),
        };
        self.pos = usize::try_from(base as i64 + delta).map_err(|_| invalid_seek())?;
        Ok(self.pos as u64)
    }
}

impl Read for MockFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let fs = self.fs.borrow();
        let rest = fs.data[self.id].unsynced.get(self.pos..).unwrap_or(&[]);
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl DbFile for MockFile {
    fn write(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        self.fs.borrow_mut().write(self.id, self.pos, buf)?;
        self.pos += buf.len();
        Ok(())
    }

    fn sync(&mut self) -> anyhow::Result<()> {
        self.fs.borrow_mut().sync(self.id)
    }

    fn len(&self) -> anyhow::Result<u64> {
        Ok(self.fs.borrow().data[self.id].unsynced.len() as u64)
    }
}

/// A view of a `MockFs` rooted at some subdirectory. Clones share the same
/// filesystem.
#[derive(Clone, Debug)]
pub struct MockDir {
    pub fs: Rc<RefCell<MockFs>>,
    prefix: Vec<String>,
}

impl Default for MockDir {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDir {
    pub fn new() -> Self {
        MockDir {
            fs: Rc::new(RefCell::new(MockFs::default())),
            prefix: Vec::new(),
        }
    }

    fn components<P: AsRef<Path>>(&self, p: &P) -> Vec<String> {
        let mut out = self.prefix.clone();
        out.extend(
            p.as_ref()
                .iter()
                .map(|s| s.to_string_lossy().into_owned()),
        );
        out
    }

    fn full_path<P: AsRef<Path>>(&self, p: &P) -> String {
        self.components(p).join("/")
    }

    fn handle(&self, id: FileId) -> MockFile {
        MockFile {
            fs: self.fs.clone(),
            id,
            pos: 0,
        }
    }
}

impl DbDir for MockDir {
    type DbFile = MockFile;

    fn cd<P>(&mut self, dir_name: &P) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        Ok(MockDir {
            fs: self.fs.clone(),
            prefix: self.components(dir_name),
        })
    }

    fn unlink<P>(&mut self, fname: &P) -> anyhow::Result<bool>
    where
        P: AsRef<Path>,
    {
        let path = self.full_path(fname);
        self.fs.borrow_mut().unlink(path)
    }

    fn ls(&mut self) -> anyhow::Result<Vec<String>> {
        let mut fs = self.fs.borrow_mut();
        let mut names: Vec<String> = fs
            .names
            .keys()
            .filter_map(|path| {
                let mut parts: Vec<&str> = path.split('/').collect();
                let name = parts.pop()?;
                (parts == self.prefix).then(|| name.to_owned())
            })
            .collect();
        names.sort();
        fs.events.push(Event::Ls(names.clone()));
        Ok(names)
    }

    fn create<P>(&mut self, fname: &P) -> anyhow::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>,
    {
        let path = self.full_path(fname);
        let id = self.fs.borrow_mut().create(path)?;
        Ok(id.map(|id| self.handle(id)))
    }

    fn open<P>(&mut self, fname: &P) -> anyhow::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>,
    {
        let path = self.full_path(fname);
        let id = self.fs.borrow_mut().open(path);
        Ok(id.map(|id| self.handle(id)))
    }

    fn rename<P, Q>(&mut self, from: &P, to: &Q) -> anyhow::Result<()>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let (from, to) = (self.full_path(from), self.full_path(to));
        self.fs.borrow_mut().rename(from, to)
    }
}

/// One filesystem operation, as recorded by `MockFs`. Reads are not
/// recorded; opens are, whether or not the file exists.
#[derive(Debug, Clone)]
pub enum Event {
    Create(String, FileId),
    Write(FileId, usize, Vec<u8>),
    Sync(FileId),
    Rename(String, String),
    Unlink(String),
    Open(String),
    Ls(Vec<String>),
}

impl Event {
    /// Writes the event on one line, with written bytes summarized by length.
    pub fn write_abbrev<W: std::fmt::Write>(&self, w: &mut W) -> std::fmt::Result {
        match self {
            Event::Create(name, id) => write!(w, "Create({}, {})", name, id),
            Event::Write(id, offset, bytes) => {
                write!(w, "Write({}, {}, {} bytes)", id, offset, bytes.len())
            }
            Event::Sync(id) => write!(w, "Sync({})", id),
            Event::Rename(from, to) => write!(w, "Rename({}, {})", from, to),
            Event::Unlink(name) => write!(w, "Unlink({})", name),
            Event::Open(name) => write!(w, "Open({})", name),
            Event::Ls(names) => write!(w, "Ls() -> {:?}", names),
        }
    }
}

#[derive(Debug, Default)]
pub struct MockFs {
    names: HashMap<String, FileId>,
    data: Vec<MockData>,
    events: Vec<Event>,
    // Mutations left before the filesystem goes down. `Some(0)` is down.
    crash_budget: Option<usize>,
}

impl MockFs {
    /// Lets `ops` more mutations through, then fails every later one until
    /// `reboot`.
    pub fn schedule_crash(&mut self, ops: usize) {
        self.crash_budget = Some(ops);
    }

    /// Drops everything not synced and brings the filesystem back up.
    pub fn reboot(&mut self) {
        for file in &mut self.data {
            file.unsynced = file.synced.clone();
        }
        self.crash_budget = None;
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    fn mutate(&mut self) -> anyhow::Result<()> {
        match &mut self.crash_budget {
            Some(0) => bail!("filesystem is down"),
            Some(left) => *left -= 1,
            None => {}
        }
        Ok(())
    }

    fn create(&mut self, path: String) -> anyhow::Result<Option<FileId>> {
        self.mutate()?;
        if self.names.contains_key(&path) {
            return Ok(None);
        }
        let id = self.data.len();
        self.data.push(MockData::default());
        self.events.push(Event::Create(path.clone(), id));
        self.names.insert(path, id);
        Ok(Some(id))
    }

    fn unlink(&mut self, path: String) -> anyhow::Result<bool> {
        self.mutate()?;
        let existed = self.names.remove(&path).is_some();
        self.events.push(Event::Unlink(path));
        Ok(existed)
    }

    fn open(&mut self, path: String) -> Option<FileId> {
        let id = self.names.get(&path).copied();
        self.events.push(Event::Open(path));
        id
    }

    fn rename(&mut self, from: String, to: String) -> anyhow::Result<()> {
        self.mutate()?;
        if let Some(id) = self.names.remove(&from) {
            self.names.insert(to.clone(), id);
        }
        self.events.push(Event::Rename(from, to));
        Ok(())
    }

    fn write(&mut self, id: FileId, offset: usize, bytes: &[u8]) -> anyhow::Result<()> {
        self.mutate()?;
        let file = &mut self.data[id].unsynced;
        let end = offset + bytes.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[offset..end].copy_from_slice(bytes);
        self.events.push(Event::Write(id, offset, bytes.to_vec()));
        Ok(())
    }

    fn sync(&mut self, id: FileId) -> anyhow::Result<()> {
        self.mutate()?;
        let file = &mut self.data[id];
        file.synced = file.unsynced.clone();
        self.events.push(Event::Sync(id));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Seek, SeekFrom};

    use super::{read_to_end, DbDir, DbFile, MockDir, OsDir};

    #[test]
    fn test_mock_file() -> anyhow::Result<()> {
        let mut dir = MockDir::new();
        let mut seg = dir.create(&"seg")?.unwrap();
        seg.write(b"abcd")?;
        assert!(seg.read_all_synced().is_empty());
        assert_eq!(read_to_end(&mut seg)?, b"abcd");
        seg.sync()?;
        assert_eq!(seg.read_all_synced(), b"abcd");
        assert!(dir.create(&"seg")?.is_none());

        // Handles share contents but not positions.
        let mut other = dir.open(&"seg")?.unwrap();
        other.seek(SeekFrom::End(-2))?;
        let mut tail = [0_u8; 4];
        assert_eq!(other.read(&mut tail)?, 2);
        assert_eq!(&tail[..2], b"cd");
        assert_eq!(other.read(&mut tail)?, 0);
        assert!(other.seek(SeekFrom::Current(-10)).is_err());

        // A missing file is still recorded as opened.
        assert!(dir.open(&"nope")?.is_none());
        let mut trace = String::new();
        for event in (*dir.fs).borrow_mut().take_events() {
            event.write_abbrev(&mut trace).unwrap();
            trace.push(';');
        }
        assert_eq!(
            trace,
            "Create(seg, 0);Write(0, 0, 4 bytes);Sync(0);Open(seg);Open(nope);"
        );
        Ok(())
    }

    #[test]
    fn test_mock_crash() -> anyhow::Result<()> {
        let mut dir = MockDir::new();
        let mut sub = dir.cd(&"sub")?;
        let mut a = sub.create(&"a")?.unwrap();
        a.write(b"synced")?;
        a.sync()?;
        (*dir.fs).borrow_mut().schedule_crash(1);
        a.write(b" lost")?;
        assert!(a.sync().is_err());
        (*dir.fs).borrow_mut().reboot();
        assert_eq!(read_to_end(&mut a)?, b"synced");
        assert_eq!(sub.ls()?, vec!["a".to_owned()]);
        assert!(dir.ls()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_os_dir() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut dir = OsDir::new(tmp.path())?;
        let mut f = dir.create(&"data")?.unwrap();
        f.write(b"hello")?;
        f.sync()?;
        assert_eq!(f.len()?, 5);
        assert!(dir.create(&"data")?.is_none());

        dir.rename(&"data", &"renamed")?;
        assert!(dir.open(&"data")?.is_none());
        let mut g = dir.open(&"renamed")?.unwrap();
        assert_eq!(read_to_end(&mut g)?, b"hello");
        assert_eq!(dir.ls()?, vec!["renamed".to_owned()]);
        assert!(dir.unlink(&"renamed")?);
        assert!(!dir.unlink(&"renamed")?);
        Ok(())
    }
}
