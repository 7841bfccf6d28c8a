//! Shared fixtures for integration tests
//!
//! `ScriptedEngine` stands in for the external physics engine: it derives its
//! hits from the worker seed, so identical seeds give identical output, and it
//! can be told to fail, panic, hang or raise the stop signal at a given tick.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use particle_sim_core::config::resolver::resolve_layers;
use particle_sim_core::config::sources::tree_layer;
use particle_sim_core::{
    Configuration, Engine, EngineError, EngineFactory, EngineHit, EngineSetup, RngManager,
    StopSignal, TimeBucket,
};
use serde_json::{json, Value};
use tempfile::TempDir;

// ============================================================================
// Scripted engine
// ============================================================================

/// Species the scripted engine emits, in rotation with the RNG
pub const SPECIES: [(&str, i64); 4] = [("mu-", 13), ("mu+", -13), ("e-", 11), ("gamma", 22)];

/// Something a scripted worker does at a given tick instead of beaming on
#[derive(Debug, Clone)]
pub enum Script {
    Fail,
    Panic,
    Hang(Duration),
    Stop(StopSignal),
}

/// What one engine saw, recorded for assertions
#[derive(Debug, Clone, Default)]
pub struct EngineLog {
    pub seed: u64,
    pub macros: Vec<PathBuf>,
    pub buckets: Vec<(u64, u32)>,
    pub export_gdml: Option<PathBuf>,
    pub shut_down: bool,
}

#[derive(Default)]
pub struct ScriptedFactory {
    /// Hits per primary event
    pub hits_per_event: usize,
    /// Per-worker scripts keyed by (worker, tick)
    scripts: BTreeMap<(usize, u64), Script>,
    logs: Arc<Mutex<BTreeMap<usize, EngineLog>>>,
}

impl ScriptedFactory {
    pub fn new(hits_per_event: usize) -> Self {
        Self {
            hits_per_event,
            ..Self::default()
        }
    }

    pub fn with_script(mut self, worker: usize, tick: u64, script: Script) -> Self {
        self.scripts.insert((worker, tick), script);
        self
    }

    pub fn log(&self, worker: usize) -> EngineLog {
        self.logs
            .lock()
            .unwrap()
            .get(&worker)
            .cloned()
            .unwrap_or_default()
    }
}

impl EngineFactory for ScriptedFactory {
    fn create(&self, setup: &EngineSetup) -> Result<Box<dyn Engine>, EngineError> {
        let scripts = self
            .scripts
            .iter()
            .filter(|((worker, _), _)| *worker == setup.worker)
            .map(|((_, tick), script)| (*tick, script.clone()))
            .collect();
        Ok(Box::new(ScriptedEngine {
            worker: setup.worker,
            rng: RngManager::new(setup.seed),
            hits_per_event: self.hits_per_event,
            tick: 0,
            scripts,
            logs: Arc::clone(&self.logs),
        }))
    }
}

pub struct ScriptedEngine {
    worker: usize,
    rng: RngManager,
    hits_per_event: usize,
    tick: u64,
    scripts: BTreeMap<u64, Script>,
    logs: Arc<Mutex<BTreeMap<usize, EngineLog>>>,
}

impl ScriptedEngine {
    fn record(&self, f: impl FnOnce(&mut EngineLog)) {
        let mut logs = self.logs.lock().unwrap();
        f(logs.entry(self.worker).or_default());
    }

    /// Uniform value in [0, 1)
    fn unit(&mut self) -> f64 {
        (self.rng.next() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    fn species(&mut self) -> (&'static str, i64) {
        SPECIES[(self.rng.next() % SPECIES.len() as u64) as usize]
    }
}

impl Engine for ScriptedEngine {
    fn initialize(&mut self, setup: &EngineSetup) -> Result<(), EngineError> {
        let seed = setup.seed;
        let export = setup.export_gdml.clone();
        if let Some(path) = &export {
            fs::write(path, "<gdml/>")?;
        }
        self.record(|log| {
            log.seed = seed;
            log.export_gdml = export;
        });
        Ok(())
    }

    fn execute_macro(&mut self, path: &Path) -> Result<(), EngineError> {
        if !path.is_file() {
            return Err(EngineError::Rejected {
                op: "execute_macro".to_string(),
                message: format!("{} not found", path.display()),
            });
        }
        let path = path.to_path_buf();
        self.record(|log| log.macros.push(path));
        Ok(())
    }

    fn apply_environment(&mut self, bucket: &TimeBucket) -> Result<(), EngineError> {
        let entry = (bucket.index, bucket.density_day_idx);
        self.record(|log| log.buckets.push(entry));
        Ok(())
    }

    fn beam_on(&mut self, n_events: u64) -> Result<Vec<EngineHit>, EngineError> {
        let tick = self.tick;
        self.tick += 1;

        match self.scripts.get(&tick) {
            Some(Script::Fail) => {
                return Err(EngineError::Protocol(format!("scripted failure at tick {tick}")))
            }
            Some(Script::Panic) => panic!("scripted panic at tick {tick}"),
            Some(Script::Hang(duration)) => std::thread::sleep(*duration),
            Some(Script::Stop(stop)) => stop.stop(),
            None => {}
        }

        let mut hits = Vec::new();
        for event in 0..n_events {
            for track in 0..self.hits_per_event {
                let (particle, pdg) = self.species();
                hits.push(EngineHit {
                    event_id: event,
                    track_id: track as u64 + 1,
                    particle: particle.to_string(),
                    pdg,
                    momentum: [self.unit(), self.unit(), -self.unit()],
                    position: [self.unit(), self.unit(), 0.0],
                    theta: self.unit(),
                    phi: self.unit(),
                    time: self.unit() * 1e3,
                    local_time: self.unit(),
                    detector: None,
                });
            }
        }
        Ok(hits)
    }

    fn shutdown(&mut self) -> Result<(), EngineError> {
        self.record(|log| log.shut_down = true);
        Ok(())
    }
}

// ============================================================================
// Input fixtures
// ============================================================================

/// Density file with days `0..days`; density scales with the day index
pub fn density_json(days: u32) -> Value {
    let mut doc = serde_json::Map::new();
    for day in 0..days {
        let scale = 1.0 + f64::from(day);
        doc.insert(
            day.to_string(),
            json!({
                "altitude": [0.0, 20.0, 40.0, 60.0, 80.0],
                "T": [288.0, 217.0, 250.0, 247.0, 199.0],
                "density": [1.2 * scale, 0.09 * scale, 0.004 * scale, 0.0003 * scale, 0.00002 * scale],
            }),
        );
    }
    Value::Object(doc)
}

/// Temporary directory with a density file, a macro file and a save dir
pub struct Fixture {
    pub dir: TempDir,
    pub density_file: PathBuf,
    pub macro_file: PathBuf,
    pub save_dir: PathBuf,
}

impl Fixture {
    pub fn new(days: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let density_file = dir.path().join("density.json");
        fs::write(&density_file, density_json(days).to_string()).unwrap();
        let macro_file = dir.path().join("run.mac");
        fs::write(&macro_file, "/run/initialize\n").unwrap();
        let save_dir = dir.path().join("results");
        Self {
            dir,
            density_file,
            macro_file,
            save_dir,
        }
    }

    /// Minimal valid configuration tree for this fixture
    pub fn tree(&self) -> Value {
        json!({
            "random_seed": 1234,
            "macro_files": [self.macro_file],
            "save_dir": self.save_dir,
            "sim_cycles": 3,
            "constructor": {
                "atmos_n_points": 5,
                "sensitive_detectors": { "particles": ["all"] },
                "density_profile": { "density_file": self.density_file }
            },
            "scheduler": { "worker_grace_period": 30.0 }
        })
    }

    /// Resolve `tree()` with `overrides` merged on top
    pub fn config(&self, overrides: Value) -> Configuration {
        let base = tree_layer(&self.tree()).unwrap();
        let top = tree_layer(&overrides).unwrap();
        resolve_layers(&[base, top]).unwrap()
    }
}

/// Read every row of a particle CSV
pub fn read_records(path: &Path) -> Vec<particle_sim_core::ParticleRecord> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader.deserialize().map(|row| row.unwrap()).collect()
}
