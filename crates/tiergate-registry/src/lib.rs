#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tiergate_domain::{
    hash_bytes, ArtifactId, GovernanceError, ScenarioAssertion, TestArtifact, Tier,
};
use tracing::{debug, info};

const ARTIFACT_EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];

/// Root directory per tier. Protected is mandatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierRoots {
    pub protected: PathBuf,
    pub candidate: Option<PathBuf>,
    pub owned: Option<PathBuf>,
}

impl TierRoots {
    #[must_use]
    pub fn root_for(&self, tier: Tier) -> Option<&Path> {
        match tier {
            Tier::Protected => Some(self.protected.as_path()),
            Tier::Candidate => self.candidate.as_deref(),
            Tier::Owned => self.owned.as_deref(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ArtifactDocument {
    id: String,
    #[serde(default)]
    command: Option<Vec<String>>,
    #[serde(default)]
    assertions: Vec<ScenarioAssertion>,
}

/// Read-only view over the artifacts discovered for one run.
#[derive(Debug, Clone)]
pub struct Catalog {
    protected_root: PathBuf,
    artifacts: Vec<TestArtifact>,
}

impl Catalog {
    #[must_use]
    pub fn artifacts(&self) -> &[TestArtifact] {
        &self.artifacts
    }

    #[must_use]
    pub fn protected_root(&self) -> &Path {
        &self.protected_root
    }

    pub fn by_tier(&self, tier: Tier) -> impl Iterator<Item = &TestArtifact> {
        self.artifacts
            .iter()
            .filter(move |artifact| artifact.tier() == tier)
    }

    #[must_use]
    pub fn get(&self, id: &ArtifactId) -> Option<&TestArtifact> {
        self.artifacts.iter().find(|artifact| artifact.id() == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Protected sources keyed by their location relative to the Protected root.
    #[must_use]
    pub fn protected_sources(&self) -> BTreeMap<String, &TestArtifact> {
        self.by_tier(Tier::Protected)
            .map(|artifact| {
                (
                    location_key(&self.protected_root, artifact.source_location()),
                    artifact,
                )
            })
            .collect()
    }

    /// Content hash per Protected location, as captured at discovery.
    #[must_use]
    pub fn protected_hashes(&self) -> BTreeMap<String, String> {
        self.protected_sources()
            .into_iter()
            .map(|(location, artifact)| (location, artifact.content_hash().to_string()))
            .collect()
    }
}

/// Outcome of comparing Protected sources against their recorded baselines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumReport {
    pub unchanged: Vec<String>,
    /// Locations with no baseline yet, paired with their current hash.
    pub new_sources: Vec<(String, String)>,
}

/// Discovers every artifact file beneath one tier root.
///
/// # Errors
/// Returns [`GovernanceError::Discovery`] when the root cannot be enumerated
/// or a file cannot be read or parsed.
pub fn discover(tier: Tier, root: &Path) -> Result<Vec<TestArtifact>, GovernanceError> {
    let files = enumerate_root(tier, root)?;

    let mut artifacts = Vec::with_capacity(files.len());
    for path in files {
        artifacts.push(load_artifact(tier, &path)?);
    }

    debug!(tier = tier.as_str(), root = %root.display(), count = artifacts.len(), "discovered tier artifacts");
    Ok(artifacts)
}

/// Hashes the raw bytes of every Protected source, keyed by location.
/// Nothing is parsed, so an edit that breaks a document still hashes.
///
/// # Errors
/// Returns [`GovernanceError::Discovery`] when the root cannot be enumerated
/// or a source cannot be read.
pub fn hash_protected_sources(root: &Path) -> Result<BTreeMap<String, String>, GovernanceError> {
    let mut hashes = BTreeMap::new();
    for path in enumerate_root(Tier::Protected, root)? {
        let bytes = read_source(&path)?;
        hashes.insert(location_key(root, &path), hash_bytes(&bytes));
    }
    Ok(hashes)
}

fn enumerate_root(tier: Tier, root: &Path) -> Result<Vec<PathBuf>, GovernanceError> {
    let metadata = fs::metadata(root).map_err(|err| {
        GovernanceError::Discovery(format!(
            "{tier} root {} is unreadable: {err}",
            root.display()
        ))
    })?;
    if !metadata.is_dir() {
        return Err(GovernanceError::Discovery(format!(
            "{tier} root {} is not a directory",
            root.display()
        )));
    }

    let mut files = Vec::new();
    collect_artifact_files(root, &mut files)?;
    files.sort();
    Ok(files)
}

/// Discovers the selected tiers and validates the combined catalog.
///
/// Protected is always discovered. Optional tiers are discovered only when
/// they are listed in `selected` and have a root.
///
/// # Errors
/// Returns [`GovernanceError::Discovery`] for unreadable roots, duplicate
/// artifact ids, or scenario keys repeated inside one tier.
pub fn build_catalog(roots: &TierRoots, selected: &[Tier]) -> Result<Catalog, GovernanceError> {
    let mut artifacts = discover(Tier::Protected, &roots.protected)?;

    for tier in [Tier::Candidate, Tier::Owned] {
        if !selected.contains(&tier) {
            continue;
        }
        let Some(root) = roots.root_for(tier) else {
            return Err(GovernanceError::Discovery(format!(
                "{tier} tier selected but no root was provided"
            )));
        };
        artifacts.extend(discover(tier, root)?);
    }

    validate_catalog(&artifacts)?;

    info!(
        protected = artifacts.iter().filter(|a| a.tier() == Tier::Protected).count(),
        candidate = artifacts.iter().filter(|a| a.tier() == Tier::Candidate).count(),
        owned = artifacts.iter().filter(|a| a.tier() == Tier::Owned).count(),
        "catalog built"
    );

    Ok(Catalog {
        protected_root: roots.protected.clone(),
        artifacts,
    })
}

fn validate_catalog(artifacts: &[TestArtifact]) -> Result<(), GovernanceError> {
    let mut ids = BTreeSet::new();
    let mut keys_by_tier: BTreeMap<Tier, BTreeMap<&str, &ArtifactId>> = BTreeMap::new();

    for artifact in artifacts {
        if !ids.insert(artifact.id()) {
            return Err(GovernanceError::Discovery(format!(
                "artifact id {} is declared more than once",
                artifact.id()
            )));
        }

        let keys = keys_by_tier.entry(artifact.tier()).or_default();
        for key in artifact.scenario_keys() {
            if let Some(owner) = keys.insert(key, artifact.id()) {
                return Err(GovernanceError::Discovery(format!(
                    "scenario_key {key} appears in both {owner} and {} within the {} tier",
                    artifact.id(),
                    artifact.tier()
                )));
            }
        }
    }

    Ok(())
}

/// Compares current Protected hashes with the last-known-good baselines.
///
/// `current` comes from [`hash_protected_sources`], so the guard runs before
/// any document is parsed.
///
/// # Errors
/// Returns [`GovernanceError::ProtectedMutationDetected`] when a baselined
/// source changed or disappeared.
pub fn check_protected_checksums(
    current: &BTreeMap<String, String>,
    baselines: &BTreeMap<String, String>,
) -> Result<ChecksumReport, GovernanceError> {
    let mut report = ChecksumReport::default();

    for (location, expected) in baselines {
        match current.get(location) {
            Some(actual) if actual == expected => {
                report.unchanged.push(location.clone());
            }
            Some(actual) => {
                return Err(GovernanceError::ProtectedMutationDetected {
                    location: location.clone(),
                    expected: expected.clone(),
                    actual: actual.clone(),
                });
            }
            None => {
                return Err(GovernanceError::ProtectedMutationDetected {
                    location: location.clone(),
                    expected: expected.clone(),
                    actual: "missing".to_string(),
                });
            }
        }
    }

    for (location, hash) in current {
        if !baselines.contains_key(location) {
            report.new_sources.push((location.clone(), hash.clone()));
        }
    }

    Ok(report)
}

/// Confirms the catalog was parsed from the bytes the checksum guard hashed.
///
/// # Errors
/// Returns [`GovernanceError::ProtectedMutationDetected`] when a source was
/// written, added or removed between hashing and parsing.
pub fn confirm_catalog_sources(
    catalog: &Catalog,
    scanned: &BTreeMap<String, String>,
) -> Result<(), GovernanceError> {
    let parsed = catalog.protected_hashes();
    let locations: BTreeSet<&String> = parsed.keys().chain(scanned.keys()).collect();
    for location in locations {
        let expected = scanned.get(location);
        let actual = parsed.get(location);
        if expected != actual {
            let missing = || "missing".to_string();
            return Err(GovernanceError::ProtectedMutationDetected {
                location: location.clone(),
                expected: expected.cloned().unwrap_or_else(missing),
                actual: actual.cloned().unwrap_or_else(missing),
            });
        }
    }
    Ok(())
}

/// Re-hashes every Protected source in the catalog against the hash captured
/// at discovery.
///
/// # Errors
/// Returns [`GovernanceError::ProtectedMutationDetected`] on any difference,
/// including a source that can no longer be read.
pub fn verify_protected_sources(catalog: &Catalog) -> Result<(), GovernanceError> {
    for (location, artifact) in catalog.protected_sources() {
        let actual = match fs::read(artifact.source_location()) {
            Ok(bytes) => hash_bytes(&bytes),
            Err(_) => "missing".to_string(),
        };
        if actual != artifact.content_hash() {
            return Err(GovernanceError::ProtectedMutationDetected {
                location,
                expected: artifact.content_hash().to_string(),
                actual,
            });
        }
    }
    Ok(())
}

/// Location of a source relative to its tier root, with `/` separators.
#[must_use]
pub fn location_key(root: &Path, source: &Path) -> String {
    let relative = source.strip_prefix(root).unwrap_or(source);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn collect_artifact_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), GovernanceError> {
    let entries = fs::read_dir(dir).map_err(|err| {
        GovernanceError::Discovery(format!("failed to enumerate {}: {err}", dir.display()))
    })?;

    for entry in entries {
        let entry = entry.map_err(|err| {
            GovernanceError::Discovery(format!("failed to enumerate {}: {err}", dir.display()))
        })?;
        let path = entry.path();
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }

        let file_type = entry.file_type().map_err(|err| {
            GovernanceError::Discovery(format!("failed to stat {}: {err}", path.display()))
        })?;
        if file_type.is_symlink() {
            let target = fs::metadata(&path).map_err(|err| {
                GovernanceError::Discovery(format!(
                    "symlink {} cannot be resolved: {err}",
                    path.display()
                ))
            })?;
            if target.is_dir() {
                return Err(GovernanceError::Discovery(format!(
                    "symlinked directory {} is not supported under a tier root",
                    path.display()
                )));
            }
            if target.is_file() && has_artifact_extension(&path) {
                out.push(path);
            }
        } else if file_type.is_dir() {
            collect_artifact_files(&path, out)?;
        } else if has_artifact_extension(&path) {
            out.push(path);
        }
    }

    Ok(())
}

fn has_artifact_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ARTIFACT_EXTENSIONS.contains(&ext))
}

fn load_artifact(tier: Tier, path: &Path) -> Result<TestArtifact, GovernanceError> {
    let bytes = read_source(path)?;
    let content_hash = hash_bytes(&bytes);

    let value = parse_document(path, &bytes)?;
    let document: ArtifactDocument = serde_json::from_value(value).map_err(|err| {
        GovernanceError::Discovery(format!("invalid artifact {}: {err}", path.display()))
    })?;

    let id = ArtifactId::new(&document.id).map_err(|err| {
        GovernanceError::Discovery(format!("invalid artifact {}: {err}", path.display()))
    })?;

    TestArtifact::new(
        id,
        tier,
        path.to_path_buf(),
        content_hash,
        document.command,
        document.assertions,
    )
    .map_err(|err| GovernanceError::Discovery(format!("invalid artifact {}: {err}", path.display())))
}

fn read_source(path: &Path) -> Result<Vec<u8>, GovernanceError> {
    fs::read(path).map_err(|err| {
        GovernanceError::Discovery(format!("failed to read {}: {err}", path.display()))
    })
}

fn parse_document(path: &Path, bytes: &[u8]) -> Result<Value, GovernanceError> {
    let is_json = path.extension().and_then(|ext| ext.to_str()) == Some("json");
    if is_json {
        return serde_json::from_slice(bytes).map_err(|err| {
            GovernanceError::Discovery(format!("failed to parse {}: {err}", path.display()))
        });
    }

    let yaml: serde_yaml::Value = serde_yaml::from_slice(bytes).map_err(|err| {
        GovernanceError::Discovery(format!("failed to parse {}: {err}", path.display()))
    })?;
    serde_json::to_value(yaml).map_err(|err| {
        GovernanceError::Discovery(format!(
            "{} is not representable as JSON: {err}",
            path.display()
        ))
    })
}
