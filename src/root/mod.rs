// The manifest: a small serde value persisted as JSON under `ROOT`.
//
// Writes go to `ROOT_TMP`, are synced, then renamed over `ROOT`, so a reader
// always sees either the old or the new manifest in full.

use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};

use crate::fs::{read_to_end, DbDir, DbFile};

const ROOT: &str = "ROOT";
const ROOT_TMP: &str = "ROOT_TMP";

#[derive(Debug)]
pub struct Root<T, D>
where
    T: Serialize + DeserializeOwned + Default,
    D: DbDir,
{
    dir: D,
    pub(crate) data: T,
}

impl<T, D> Root<T, D>
where
    T: Serialize + DeserializeOwned + Default,
    D: DbDir,
{
    /// Loads the manifest, writing a default one if there is none.
    pub fn load(mut dir: D) -> anyhow::Result<Self> {
        match dir.open(&ROOT)? {
            Some(mut file) => {
                let contents = read_to_end(&mut file)?;
                let data = serde_json::from_slice(&contents).context("parsing ROOT")?;
                Ok(Root { dir, data })
            }
            None => {
                let mut result = Root {
                    dir,
                    data: T::default(),
                };
                result.write(T::default())?;
                Ok(result)
            }
        }
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn write(&mut self, t: T) -> anyhow::Result<()> {
        // A crash can leave a stale temp file behind.
        self.dir.unlink(&ROOT_TMP)?;
        let mut file = self
            .dir
            .create(&ROOT_TMP)?
            .context("ROOT_TMP exists after unlinking it")?;
        let encoded = serde_json::to_string(&t)?;
        file.write(encoded.as_bytes())?;
        file.sync()?;
        self.dir.rename(&ROOT_TMP, &ROOT)?;
        self.data = t;

        Ok(())
    }

    pub fn transform<F>(&mut self, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(T) -> T,
        T: Clone,
    {
        let next = f(self.data.clone());
        self.write(next)
    }
}
