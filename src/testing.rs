use std::ops::Deref;

use tempfile::{Builder, NamedTempFile};

use crate::env::{Environment, Options};

pub(crate) fn temp_file() -> crate::Result<NamedTempFile> {
    let temp_file = Builder::new()
        .prefix("hamsterdb-")
        .suffix(".db")
        .tempfile()?;

    Ok(temp_file)
}

pub(crate) struct TestEnv {
    pub(crate) temp_file: Option<NamedTempFile>,
    pub(crate) env: Option<Environment>,
}

impl Deref for TestEnv {
    type Target = Environment;

    fn deref(&self) -> &Self::Target {
        self.env.as_ref().unwrap()
    }
}

impl TestEnv {
    pub(crate) fn new() -> crate::Result<Self> {
        Self::with_options(Options::default())
    }

    pub(crate) fn with_options(options: Options) -> crate::Result<Self> {
        let temp_file = temp_file()?;

        let env = Environment::create(temp_file.path(), options)?;

        Ok(Self {
            temp_file: Some(temp_file),
            env: Some(env),
        })
    }

    /// Drops the handle but keeps the file for a reopen.
    pub(crate) fn into_path(mut self) -> NamedTempFile {
        self.env = None;
        self.temp_file.take().unwrap()
    }
}
