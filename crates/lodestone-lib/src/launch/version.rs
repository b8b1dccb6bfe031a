//! Resolution of installed versions from `versions/<id>/<id>.json`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const MAX_INHERITANCE_DEPTH: usize = 8;
const DEFAULT_LIBRARY_REPOSITORY: &str = "https://libraries.minecraft.net/";

/// A version with its whole `inheritsFrom` chain folded in.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedVersion {
    pub id: String,
    /// Id of the vanilla version at the root of the chain.
    pub minecraft_version: String,
    pub main_class: String,
    pub jar: PathBuf,
    pub jar_url: Option<String>,
    pub jar_sha1: Option<String>,
    pub libraries: Vec<ResolvedLibrary>,
    pub asset_index: String,
    pub version_type: String,
    pub jvm_arguments: Vec<Argument>,
    pub game_arguments: Vec<Argument>,
    /// Pre-1.13 whitespace separated game arguments.
    pub minecraft_arguments: Option<String>,
    pub natives_directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedLibrary {
    pub name: String,
    pub path: PathBuf,
    pub url: Option<String>,
    pub sha1: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Argument {
    Simple(String),
    Conditional { rules: Vec<Rule>, value: ArgumentValue },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgumentValue {
    Single(String),
    Multiple(Vec<String>),
}

impl ArgumentValue {
    pub fn parts(&self) -> Vec<&str> {
        match self {
            ArgumentValue::Single(s) => vec![s.as_str()],
            ArgumentValue::Multiple(parts) => parts.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub action: RuleAction,
    #[serde(default)]
    pub os: Option<OsRule>,
    #[serde(default)]
    pub features: Option<HashMap<String, bool>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Disallow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsRule {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arch: Option<String>,
}

/// Name of the host OS as used in version rules.
pub fn current_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "osx",
        other => other,
    }
}

/// Evaluate version rules against the host. `features` lists the enabled
/// launch features; any other feature is treated as disabled.
pub fn rules_allow(rules: &[Rule], features: &HashSet<&str>) -> bool {
    if rules.is_empty() {
        return true;
    }
    let mut allow = false;
    for rule in rules {
        let os_matches = rule.os.as_ref().map_or(true, |os| {
            os.name.as_deref().map_or(true, |name| name == current_os())
                && os
                    .arch
                    .as_deref()
                    .map_or(true, |arch| arch == std::env::consts::ARCH)
        });
        let features_match = rule.features.as_ref().map_or(true, |wanted| {
            wanted
                .iter()
                .all(|(name, value)| features.contains(name.as_str()) == *value)
        });
        if os_matches && features_match {
            allow = rule.action == RuleAction::Allow;
        }
    }
    allow
}

/// `group:artifact:version[:classifier][@ext]` to a repository relative path.
pub fn maven_to_path(coords: &str) -> Result<String> {
    let (coords, extension) = coords.split_once('@').unwrap_or((coords, "jar"));
    let parts: Vec<&str> = coords.split(':').collect();
    if parts.len() < 3 {
        bail!("Invalid maven coordinates: {}", coords);
    }
    let group = parts[0].replace('.', "/");
    let (artifact, version) = (parts[1], parts[2]);
    let file = match parts.get(3) {
        Some(classifier) => format!("{artifact}-{version}-{classifier}.{extension}"),
        None => format!("{artifact}-{version}.{extension}"),
    };
    Ok(format!("{group}/{artifact}/{version}/{file}"))
}

#[async_trait]
pub trait VersionResolver: Send + Sync {
    async fn resolve(&self, version: &str) -> Result<ResolvedVersion>;
}

/// Reads version manifests from a local game root.
#[derive(Debug, Clone)]
pub struct LocalVersionResolver {
    root: PathBuf,
}

impl LocalVersionResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.root.join("versions").join(id).join(format!("{id}.json"))
    }

    async fn read_manifest(&self, id: &str) -> Result<VersionManifest> {
        let path = self.manifest_path(id);
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read version manifest {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse version manifest {:?}", path))
    }
}

#[async_trait]
impl VersionResolver for LocalVersionResolver {
    async fn resolve(&self, version: &str) -> Result<ResolvedVersion> {
        let mut chain = Vec::new();
        let mut next = Some(version.to_string());
        while let Some(id) = next {
            if chain.len() >= MAX_INHERITANCE_DEPTH {
                bail!("Version {} inherits too deeply", version);
            }
            if chain.iter().any(|m: &VersionManifest| m.id == id) {
                bail!("Version {} has an inheritance cycle at {}", version, id);
            }
            let manifest = self.read_manifest(&id).await?;
            next = manifest.inherits_from.clone();
            chain.push(manifest);
        }
        merge(&self.root, version, chain)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionManifest {
    id: String,
    inherits_from: Option<String>,
    main_class: Option<String>,
    minecraft_arguments: Option<String>,
    arguments: Option<ManifestArguments>,
    #[serde(default)]
    libraries: Vec<ManifestLibrary>,
    downloads: Option<ManifestDownloads>,
    asset_index: Option<ManifestAssetIndex>,
    assets: Option<String>,
    jar: Option<String>,
    #[serde(rename = "type")]
    version_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestArguments {
    #[serde(default)]
    game: Vec<Argument>,
    #[serde(default)]
    jvm: Vec<Argument>,
}

#[derive(Debug, Deserialize)]
struct ManifestLibrary {
    name: String,
    downloads: Option<ManifestLibraryDownloads>,
    url: Option<String>,
    rules: Option<Vec<Rule>>,
}

#[derive(Debug, Deserialize)]
struct ManifestLibraryDownloads {
    artifact: Option<ManifestArtifact>,
}

#[derive(Debug, Deserialize)]
struct ManifestArtifact {
    path: Option<String>,
    url: Option<String>,
    sha1: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ManifestDownloads {
    client: Option<ManifestArtifact>,
}

#[derive(Debug, Deserialize)]
struct ManifestAssetIndex {
    id: String,
}

/// `chain` runs from the requested version to the root of its ancestry.
/// Child values win for scalars; argument lists run root first.
fn merge(root: &Path, requested: &str, chain: Vec<VersionManifest>) -> Result<ResolvedVersion> {
    let first = |f: &dyn Fn(&VersionManifest) -> Option<String>| chain.iter().find_map(f);

    let main_class = first(&|m| m.main_class.clone())
        .with_context(|| format!("Version {} declares no main class", requested))?;
    let asset_index = first(&|m| m.asset_index.as_ref().map(|a| a.id.clone()))
        .or_else(|| first(&|m| m.assets.clone()))
        .unwrap_or_else(|| "legacy".to_string());
    let version_type = first(&|m| m.version_type.clone()).unwrap_or_else(|| "release".to_string());
    let minecraft_arguments = first(&|m| m.minecraft_arguments.clone());

    let base = chain.last().context("empty version chain")?;
    let jar_id = first(&|m| m.jar.clone()).unwrap_or_else(|| base.id.clone());
    let client = base.downloads.as_ref().and_then(|d| d.client.as_ref());

    let features = HashSet::new();
    let mut seen = HashSet::new();
    let mut libraries = Vec::new();
    for library in chain.iter().flat_map(|m| &m.libraries) {
        if !library.rules.as_deref().map_or(true, |r| rules_allow(r, &features)) {
            continue;
        }
        let key = library.name.rsplitn(2, ':').last().unwrap_or(&library.name).to_string();
        if !seen.insert(key) {
            continue;
        }
        libraries.push(resolve_library(root, library)?);
    }

    let mut jvm_arguments = Vec::new();
    let mut game_arguments = Vec::new();
    for manifest in chain.iter().rev() {
        if let Some(arguments) = &manifest.arguments {
            jvm_arguments.extend(arguments.jvm.iter().cloned());
            game_arguments.extend(arguments.game.iter().cloned());
        }
    }

    Ok(ResolvedVersion {
        id: requested.to_string(),
        minecraft_version: base.id.clone(),
        main_class,
        jar: root.join("versions").join(&jar_id).join(format!("{jar_id}.jar")),
        jar_url: client.and_then(|c| c.url.clone()),
        jar_sha1: client.and_then(|c| c.sha1.clone()),
        libraries,
        asset_index,
        version_type,
        jvm_arguments,
        game_arguments,
        minecraft_arguments,
        natives_directory: root
            .join("versions")
            .join(requested)
            .join(format!("{requested}-natives")),
    })
}

fn resolve_library(root: &Path, library: &ManifestLibrary) -> Result<ResolvedLibrary> {
    let artifact = library.downloads.as_ref().and_then(|d| d.artifact.as_ref());
    let relative = match artifact.and_then(|a| a.path.clone()) {
        Some(path) => path,
        None => maven_to_path(&library.name)?,
    };
    let url = artifact.and_then(|a| a.url.clone()).or_else(|| {
        let repository = library.url.as_deref().unwrap_or(DEFAULT_LIBRARY_REPOSITORY);
        Some(format!("{}/{}", repository.trim_end_matches('/'), relative))
    });
    Ok(ResolvedLibrary {
        name: library.name.clone(),
        path: root.join("libraries").join(&relative),
        url: url.filter(|u| !u.is_empty()),
        sha1: artifact.and_then(|a| a.sha1.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn write_manifest(root: &Path, id: &str, manifest: serde_json::Value) {
        let dir = root.join("versions").join(id);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join(format!("{id}.json")), manifest.to_string())
            .await
            .unwrap();
    }

    #[test]
    fn maven_coordinates() {
        assert_eq!(
            maven_to_path("com.google.guava:guava:21.0").unwrap(),
            "com/google/guava/guava/21.0/guava-21.0.jar"
        );
        assert_eq!(
            maven_to_path("org.lwjgl:lwjgl:3.3.1:natives-linux").unwrap(),
            "org/lwjgl/lwjgl/3.3.1/lwjgl-3.3.1-natives-linux.jar"
        );
        assert_eq!(
            maven_to_path("net.minecraftforge:forge:1.20.1-47.2.0:installer@zip").unwrap(),
            "net/minecraftforge/forge/1.20.1-47.2.0/forge-1.20.1-47.2.0-installer.zip"
        );
        assert!(maven_to_path("broken").is_err());
    }

    #[test]
    fn rules_follow_last_matching_action() {
        let none = HashSet::new();
        let disallow_here: Vec<Rule> = serde_json::from_value(json!([
            { "action": "allow" },
            { "action": "disallow", "os": { "name": current_os() } }
        ]))
        .unwrap();
        assert!(!rules_allow(&disallow_here, &none));

        let demo: Vec<Rule> =
            serde_json::from_value(json!([{ "action": "allow", "features": { "is_demo_user": true } }]))
                .unwrap();
        assert!(!rules_allow(&demo, &none));
        assert!(rules_allow(&demo, &HashSet::from(["is_demo_user"])));
    }

    #[tokio::test]
    async fn inherited_versions_are_merged() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "1.20.1",
            json!({
                "id": "1.20.1",
                "mainClass": "net.minecraft.client.main.Main",
                "assetIndex": { "id": "5" },
                "type": "release",
                "downloads": { "client": { "url": "https://example.org/client.jar", "sha1": "abc" } },
                "arguments": { "game": ["--username", "${auth_player_name}"], "jvm": ["-cp", "${classpath}"] },
                "libraries": [
                    { "name": "org.ow2.asm:asm:9.3" },
                    { "name": "com.mojang:brigadier:1.1.8", "downloads": { "artifact": {
                        "path": "com/mojang/brigadier/1.1.8/brigadier-1.1.8.jar",
                        "url": "https://libraries.minecraft.net/com/mojang/brigadier/1.1.8/brigadier-1.1.8.jar",
                        "sha1": "def"
                    } } }
                ]
            }),
        )
        .await;
        write_manifest(
            dir.path(),
            "fabric-1.20.1",
            json!({
                "id": "fabric-1.20.1",
                "inheritsFrom": "1.20.1",
                "mainClass": "net.fabricmc.loader.impl.launch.knot.KnotClient",
                "arguments": { "game": [], "jvm": ["-DFabricMcEmu= net.minecraft.client.main.Main "] },
                "libraries": [
                    { "name": "org.ow2.asm:asm:9.6", "url": "https://maven.fabricmc.net/" }
                ]
            }),
        )
        .await;

        let resolved = LocalVersionResolver::new(dir.path())
            .resolve("fabric-1.20.1")
            .await
            .unwrap();
        assert_eq!(resolved.minecraft_version, "1.20.1");
        assert_eq!(resolved.main_class, "net.fabricmc.loader.impl.launch.knot.KnotClient");
        assert_eq!(resolved.asset_index, "5");
        assert_eq!(resolved.jar, dir.path().join("versions/1.20.1/1.20.1.jar"));
        assert_eq!(resolved.jar_sha1.as_deref(), Some("abc"));
        // the child's asm replaces the parent's
        assert_eq!(resolved.libraries.len(), 2);
        assert_eq!(resolved.libraries[0].name, "org.ow2.asm:asm:9.6");
        assert_eq!(
            resolved.libraries[0].url.as_deref(),
            Some("https://maven.fabricmc.net/org/ow2/asm/asm/9.6/asm-9.6.jar")
        );
        assert_eq!(resolved.jvm_arguments.len(), 3);
        assert_eq!(resolved.jvm_arguments[0], Argument::Simple("-cp".into()));
    }

    #[tokio::test]
    async fn missing_versions_fail() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalVersionResolver::new(dir.path())
            .resolve("1.8.9")
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("1.8.9"));
    }

    #[tokio::test]
    async fn inheritance_cycles_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "a", json!({ "id": "a", "inheritsFrom": "b", "mainClass": "M" })).await;
        write_manifest(dir.path(), "b", json!({ "id": "b", "inheritsFrom": "a" })).await;
        assert!(LocalVersionResolver::new(dir.path()).resolve("a").await.is_err());
    }
}
