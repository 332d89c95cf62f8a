//! Concatenate many sources into one stream.
//!
//! A [`ContainerSource`] reads its children one after the other. Directories
//! and `.list`/`.msmlist` manifests are read as containers of the files they
//! name, see [`ContainerSource::from_directory`] and [`ContainerSource::from_manifest`].
use std::fs;
use std::io::{self, prelude::*, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};

use crate::config::SourceSettings;
use crate::io::infer_format::{is_junk_name, open_with_settings};
use crate::io::lookahead::{Lookahead, PullSpectra};
use crate::io::traits::{
    compose_trail, ensure_restartable, GatherStats, SourceError, SourceKind, SpectraSource,
};
use crate::spectrum::Spectrum;

/// Whether a path names a manifest of other spectrum files
pub fn is_manifest_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            let ext = ext.to_ascii_lowercase();
            ext == "list" || ext == "msmlist"
        })
}

/// Read the paths a manifest lists, resolved against the manifest's directory
pub fn read_manifest(path: &Path) -> io::Result<Vec<PathBuf>> {
    let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let reader = BufReader::new(fs::File::open(path)?);
    let mut paths = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let entry = Path::new(line);
        if entry.is_absolute() {
            paths.push(entry.to_path_buf());
        } else {
            paths.push(base.join(entry));
        }
    }
    Ok(paths)
}

/// Where a child came from, which decides how it is rebuilt on restart
enum ChildOrigin {
    Path(PathBuf),
    Provided,
}

struct ContainerChild {
    origin: ChildOrigin,
    source: Option<Box<dyn SpectraSource>>,
}

impl ContainerChild {
    fn can_restart(&self) -> bool {
        match (&self.origin, &self.source) {
            (ChildOrigin::Path(_), _) => true,
            (ChildOrigin::Provided, Some(source)) => source.can_restart(),
            (ChildOrigin::Provided, None) => false,
        }
    }

    fn restart(&mut self, settings: &Arc<SourceSettings>) -> Result<(), SourceError> {
        match &self.origin {
            ChildOrigin::Path(path) => {
                if let Some(mut source) = self.source.take() {
                    source.close();
                }
                self.source = open_with_settings(path, settings)?;
                Ok(())
            }
            ChildOrigin::Provided => match self.source.as_mut() {
                Some(source) => source.restart(),
                None => Err(SourceError::NotRestartable(
                    "a source that was already released".to_string(),
                )),
            },
        }
    }

    /// Finish with an exhausted child, keeping provided ones for a restart
    fn release(&mut self) {
        if let Some(source) = self.source.as_mut() {
            source.close();
        }
        if let ChildOrigin::Path(_) = self.origin {
            self.source = None;
        }
    }
}

pub(crate) struct ContainerPull {
    children: Vec<ContainerChild>,
    active: usize,
    name: String,
}

impl ContainerPull {
    fn active_source(&self) -> Option<&dyn SpectraSource> {
        self.children
            .get(self.active)
            .and_then(|child| child.source.as_deref())
    }
}

impl PullSpectra for ContainerPull {
    fn pull(&mut self) -> Result<Option<Spectrum>, SourceError> {
        while let Some(child) = self.children.get_mut(self.active) {
            if let Some(source) = child.source.as_mut() {
                if let Some(mut spectrum) = source.read_next()? {
                    if !self.name.is_empty() {
                        spectrum.source = compose_trail(&self.name, &spectrum.source);
                    }
                    return Ok(Some(spectrum));
                }
                child.release();
            }
            self.active += 1;
        }
        Ok(None)
    }
}

/// A [`SpectraSource`] reading a list of other sources in order
pub struct ContainerSource {
    name: String,
    settings: Arc<SourceSettings>,
    state: Lookahead<ContainerPull>,
}

impl ContainerSource {
    /// An empty container. An empty `name` makes it a pass-through that does
    /// not add itself to the provenance trail of its spectra.
    pub fn new(name: impl Into<String>, settings: Arc<SourceSettings>) -> Self {
        let name = name.into();
        let pull = ContainerPull {
            children: Vec::new(),
            active: 0,
            name: name.clone(),
        };
        Self {
            name,
            settings,
            state: Lookahead::new(pull),
        }
    }

    /// A container over the spectrum files of a directory, in file name order
    pub fn from_directory(
        path: impl AsRef<Path>,
        settings: Arc<SourceSettings>,
    ) -> Result<Self, SourceError> {
        let path = std::path::absolute(path.as_ref())?;
        let mut entries: Vec<PathBuf> = fs::read_dir(&path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<_>>()?;
        entries.sort();
        let mut this = Self::new(path.display().to_string(), settings);
        for entry in entries {
            if entry
                .file_name()
                .is_some_and(|name| is_junk_name(&name.to_string_lossy()))
            {
                debug!("Skipping {}", entry.display());
                continue;
            }
            this.add_path(&entry)?;
        }
        Ok(this)
    }

    /// A container over the files a `.list`/`.msmlist` manifest names, one per line
    pub fn from_manifest(
        path: impl AsRef<Path>,
        settings: Arc<SourceSettings>,
    ) -> Result<Self, SourceError> {
        let path = std::path::absolute(path.as_ref())?;
        let entries = read_manifest(&path)?;
        let mut this = Self::new(path.display().to_string(), settings);
        for entry in entries {
            this.add_path(&entry)?;
        }
        Ok(this)
    }

    /// Open `path` and append it. Paths no reader accepts are skipped, returning `false`.
    pub fn add_path(&mut self, path: impl AsRef<Path>) -> Result<bool, SourceError> {
        let path = std::path::absolute(path.as_ref())?;
        let Some(source) = open_with_settings(&path, &self.settings)? else {
            return Ok(false);
        };
        self.push(ContainerChild {
            origin: ChildOrigin::Path(path),
            source: Some(source),
        })?;
        Ok(true)
    }

    /// Append an already opened source. The container can only be restarted if
    /// every such source can.
    pub fn add_source(&mut self, source: Box<dyn SpectraSource>) -> Result<(), SourceError> {
        self.push(ContainerChild {
            origin: ChildOrigin::Provided,
            source: Some(source),
        })
    }

    fn push(&mut self, child: ContainerChild) -> Result<(), SourceError> {
        self.state.inner_mut().children.push(child);
        self.state.refill()
    }

    pub fn len(&self) -> usize {
        self.state.inner().children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn gather_sequential(&mut self) -> Result<GatherStats, SourceError> {
        let mut stats = GatherStats::default();
        for child in self.state.inner_mut().children.iter_mut() {
            if let Some(source) = child.source.as_mut() {
                stats = stats.merge(source.gather_data(1)?);
            }
        }
        Ok(stats)
    }

    #[cfg(feature = "parallelism")]
    fn gather_parallel(&mut self, parallelism: usize) -> Result<GatherStats, SourceError> {
        use rayon::prelude::*;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .build()
            .map_err(|e| SourceError::Io(io::Error::other(e)))?;
        let nested_parallelism = ((parallelism as f64 / 2.0).round() as usize).max(1);
        let children = &mut self.state.inner_mut().children;
        let partials: Vec<Result<GatherStats, SourceError>> = pool.install(|| {
            children
                .par_iter_mut()
                .map(|child| match child.source.as_mut() {
                    Some(source) if source.kind() == SourceKind::Container => {
                        source.gather_data(nested_parallelism)
                    }
                    Some(source) => source.gather_data(1),
                    None => Ok(GatherStats::default()),
                })
                .collect()
        });
        // Every worker has finished, report the first failure in child order
        partials
            .into_iter()
            .try_fold(GatherStats::default(), |acc, partial| Ok(acc.merge(partial?)))
    }

    #[cfg(not(feature = "parallelism"))]
    fn gather_parallel(&mut self, parallelism: usize) -> Result<GatherStats, SourceError> {
        log::warn!("Parallel gathering requested with {parallelism} threads but the parallelism feature is disabled");
        self.gather_sequential()
    }
}

impl SpectraSource for ContainerSource {
    fn has_next(&self) -> bool {
        self.state.has_next()
    }

    fn read_next(&mut self) -> Result<Option<Spectrum>, SourceError> {
        self.state.advance()
    }

    fn current(&self) -> Option<&Spectrum> {
        self.state.current()
    }

    fn restart(&mut self) -> Result<(), SourceError> {
        ensure_restartable(self)?;
        debug!("Restarting {}", self.name);
        self.state.clear();
        let settings = self.settings.clone();
        let pull = self.state.inner_mut();
        for child in pull.children.iter_mut() {
            child.restart(&settings)?;
        }
        pull.active = 0;
        self.state.refill()
    }

    fn can_restart(&self) -> bool {
        self.state
            .inner()
            .children
            .iter()
            .all(ContainerChild::can_restart)
    }

    fn close(&mut self) {
        let pull = self.state.inner_mut();
        for child in pull.children.iter_mut() {
            if let Some(source) = child.source.as_mut() {
                source.close();
            }
        }
        pull.active = pull.children.len();
    }

    fn count_read(&self) -> u64 {
        self.state.count_read()
    }

    fn gather_data(&mut self, parallelism: usize) -> Result<GatherStats, SourceError> {
        ensure_restartable(self)?;
        let start = Instant::now();
        // Bring every child back so each can be gathered from its start
        self.restart()?;
        let stats = if parallelism <= 1 {
            self.gather_sequential()?
        } else {
            self.gather_parallel(parallelism)?
        };
        info!(
            "Gathered {} spectra with a maximum precursor mass of {:.4} from {} sources of {} in {:.3}s",
            stats.spectra_count,
            stats.max_precursor_mass,
            self.len(),
            self.input_path(),
            start.elapsed().as_secs_f64()
        );
        self.restart()?;
        Ok(stats)
    }

    fn input_path(&self) -> String {
        match self.state.inner().active_source() {
            Some(child) => compose_trail(&self.name, &child.input_path()),
            None => self.name.clone(),
        }
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Container
    }
}
