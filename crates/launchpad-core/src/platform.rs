//! Platform descriptors and the registry that maps platform / group names
//! onto them.

use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::config::{
    CommsMethod, LaunchpadConfig, PlatformConfig, PlatformGroupConfig, DEFAULT_JOB_RUNNER,
    LOCALHOST,
};
use crate::error::{LaunchpadError, Result};

/// Immutable description of one execution platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Platform {
    pub name: String,
    /// Candidate hosts in configured preference order.
    pub hosts: Vec<String>,
    pub install_target: String,
    pub communication_method: CommsMethod,
    pub job_runner: String,
    pub ssh_command: String,
    pub rsync_includes: Vec<String>,
}

impl Platform {
    pub fn from_config(cfg: &PlatformConfig) -> Self {
        let hosts = if cfg.hosts.is_empty() {
            vec![cfg.name.clone()]
        } else {
            cfg.hosts.clone()
        };
        Self {
            name: cfg.name.clone(),
            hosts,
            install_target: cfg
                .install_target
                .clone()
                .unwrap_or_else(|| cfg.name.clone()),
            communication_method: cfg.communication_method,
            job_runner: cfg.job_runner.clone(),
            ssh_command: cfg.ssh_command.clone(),
            rsync_includes: cfg.rsync_includes.clone(),
        }
    }

    pub fn localhost() -> Self {
        Self::from_config(&PlatformConfig::localhost())
    }
}

/// Lookup service over the configured platforms.
///
/// Implementations must be cheap to call; the resolver consults them once
/// per distinct platform expression per scheduling pass.
pub trait PlatformRegistry: Send + Sync {
    /// Expand a platform or platform-group name into concrete platforms,
    /// in configured order.
    fn lookup(&self, name: &str) -> Result<Vec<Arc<Platform>>>;

    /// Reverse lookup for legacy host-based configuration: find the
    /// platform serving `host` with the given job runner.
    fn platform_for_host(&self, host: &str, job_runner: Option<&str>) -> Result<String>;

    /// Install target shared with the scheduler's own filesystem.
    fn localhost_install_target(&self) -> &str {
        LOCALHOST
    }
}

/// Full-match pattern for a platform or group name.
///
/// Names are regular expressions, so one definition can serve a family of
/// platforms (`desktop[0-9]{2}`). A name that does not compile is matched
/// literally.
#[derive(Debug, Clone)]
enum NamePattern {
    Regex(Regex),
    Literal(String),
}

impl NamePattern {
    fn new(name: &str) -> Self {
        match Regex::new(&format!("^(?:{name})$")) {
            Ok(re) => NamePattern::Regex(re),
            Err(e) => {
                warn!(name = %name, error = %e, "invalid platform name pattern, matching literally");
                NamePattern::Literal(name.to_string())
            }
        }
    }

    fn is_match(&self, name: &str) -> bool {
        match self {
            NamePattern::Regex(re) => re.is_match(name),
            NamePattern::Literal(lit) => lit == name,
        }
    }
}

/// True if the platform name pattern `pattern` matches all of `name`.
pub fn name_matches(pattern: &str, name: &str) -> bool {
    NamePattern::new(pattern).is_match(name)
}

#[derive(Debug, Clone)]
struct Definition {
    config: PlatformConfig,
    pattern: NamePattern,
}

impl Definition {
    fn new(config: &PlatformConfig) -> Self {
        Self {
            pattern: NamePattern::new(&config.name),
            config: config.clone(),
        }
    }

    /// The concrete platform called `name`. Host list and install target
    /// default to `name`, not to the pattern.
    fn instantiate(&self, name: &str) -> Platform {
        Platform::from_config(&PlatformConfig {
            name: name.to_string(),
            ..self.config.clone()
        })
    }
}

/// [`PlatformRegistry`] backed by the `[[platforms]]` and
/// `[[platform_groups]]` config tables.
///
/// When several definitions match a name the last one wins.
#[derive(Debug, Clone)]
pub struct ConfigRegistry {
    /// Definition order; `localhost` first unless the config overrides it.
    definitions: Vec<Definition>,
    platforms: Vec<Arc<Platform>>,
    groups: Vec<PlatformGroupConfig>,
    group_patterns: Vec<NamePattern>,
}

impl ConfigRegistry {
    pub fn new(platforms: &[PlatformConfig], groups: &[PlatformGroupConfig]) -> Self {
        let mut definitions = Vec::with_capacity(platforms.len() + 1);
        if !platforms.iter().any(|p| p.name == LOCALHOST) {
            definitions.push(Definition::new(&PlatformConfig::localhost()));
        }
        definitions.extend(platforms.iter().map(Definition::new));
        Self {
            platforms: definitions
                .iter()
                .map(|d| Arc::new(Platform::from_config(&d.config)))
                .collect(),
            definitions,
            groups: groups.to_vec(),
            group_patterns: groups.iter().map(|g| NamePattern::new(&g.name)).collect(),
        }
    }

    pub fn from_config(config: &LaunchpadConfig) -> Self {
        Self::new(&config.platforms, &config.platform_groups)
    }

    /// All platform definitions in definition order, names as configured.
    pub fn platforms(&self) -> &[Arc<Platform>] {
        &self.platforms
    }

    pub fn groups(&self) -> &[PlatformGroupConfig] {
        &self.groups
    }

    fn platform(&self, name: &str) -> Option<Arc<Platform>> {
        self.definitions
            .iter()
            .rev()
            .find(|d| d.pattern.is_match(name))
            .map(|d| Arc::new(d.instantiate(name)))
    }

    fn group(&self, name: &str) -> Option<&PlatformGroupConfig> {
        self.groups
            .iter()
            .zip(&self.group_patterns)
            .rev()
            .find(|(_, pattern)| pattern.is_match(name))
            .map(|(group, _)| group)
    }
}

impl PlatformRegistry for ConfigRegistry {
    fn lookup(&self, name: &str) -> Result<Vec<Arc<Platform>>> {
        if let Some(group) = self.group(name) {
            return group
                .platforms
                .iter()
                .map(|member| {
                    self.platform(member).ok_or_else(|| {
                        LaunchpadError::PlatformLookup(format!(
                            "platform group {name} references undefined platform {member}"
                        ))
                    })
                })
                .collect();
        }
        self.platform(name)
            .map(|p| vec![p])
            .ok_or_else(|| LaunchpadError::PlatformLookup(format!("no platform named {name}")))
    }

    fn platform_for_host(&self, host: &str, job_runner: Option<&str>) -> Result<String> {
        let host = if host.is_empty() { LOCALHOST } else { host };
        let runner = job_runner
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_JOB_RUNNER);

        // A definition without hosts serves the hosts its name matches.
        self.definitions
            .iter()
            .rev()
            .filter(|d| d.config.job_runner == runner)
            .find_map(|d| {
                if d.config.hosts.is_empty() {
                    d.pattern.is_match(host).then(|| host.to_string())
                } else {
                    d.config
                        .hosts
                        .iter()
                        .any(|h| h == host)
                        .then(|| d.config.name.clone())
                }
            })
            .ok_or_else(|| {
                LaunchpadError::PlatformLookup(format!(
                    "no platform has host {host} with job runner {runner}"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(name: &str, hosts: &[&str], runner: &str) -> PlatformConfig {
        PlatformConfig {
            name: name.into(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            install_target: None,
            communication_method: CommsMethod::Zmq,
            job_runner: runner.into(),
            ssh_command: crate::config::DEFAULT_SSH_COMMAND.into(),
            rsync_includes: Vec::new(),
        }
    }

    fn registry() -> ConfigRegistry {
        ConfigRegistry::new(
            &[
                platform("desktop", &["d1", "d2"], "background"),
                platform("hpc", &["hpc1", "hpc2"], "pbs"),
                platform("hpc1-bg", &["hpc1"], "background"),
                platform("sugar", &["sugar", "localhost"], "slurm"),
                platform("laptop22", &[], "background"),
            ],
            &[PlatformGroupConfig {
                name: "anywhere".into(),
                platforms: vec!["desktop".into(), "hpc".into()],
            }],
        )
    }

    #[test]
    fn lookup_single_platform() {
        let found = registry().lookup("desktop").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].hosts, ["d1", "d2"]);
        assert_eq!(found[0].install_target, "desktop");
    }

    #[test]
    fn empty_hosts_default_to_platform_name() {
        let found = registry().lookup("laptop22").unwrap();
        assert_eq!(found[0].hosts, ["laptop22"]);
    }

    #[test]
    fn group_expands_in_order() {
        let names: Vec<_> = registry()
            .lookup("anywhere")
            .unwrap()
            .iter()
            .map(|p| p.name.clone())
            .collect();
        assert_eq!(names, ["desktop", "hpc"]);
    }

    #[test]
    fn unknown_platform_is_lookup_error() {
        let err = registry().lookup("moooo").unwrap_err();
        assert_eq!(err.code(), "PLATFORM_LOOKUP_ERROR");
    }

    #[test]
    fn localhost_is_implicit() {
        let found = registry().lookup("localhost").unwrap();
        assert_eq!(found[0].install_target, "localhost");
    }

    #[test]
    fn host_to_platform_respects_job_runner() {
        let reg = registry();
        assert_eq!(reg.platform_for_host("hpc1", Some("pbs")).unwrap(), "hpc");
        assert_eq!(reg.platform_for_host("hpc1", None).unwrap(), "hpc1-bg");
        assert_eq!(reg.platform_for_host("d2", None).unwrap(), "desktop");
    }

    #[test]
    fn empty_host_means_localhost() {
        let reg = registry();
        assert_eq!(reg.platform_for_host("", None).unwrap(), "localhost");
        assert_eq!(reg.platform_for_host("", Some("slurm")).unwrap(), "sugar");
        assert!(reg.platform_for_host("", Some("pbs")).is_err());
    }

    fn patterned() -> ConfigRegistry {
        ConfigRegistry::new(
            &[
                platform("hpc.*", &["hpc1"], "background"),
                platform("h.*", &["hpc3"], "background"),
                platform(r"vld\d{2,3}", &[], "background"),
                platform("nu.*", &["localhost"], "slurm"),
                platform("desktop[0-9]{2}|laptop[0-9]{2}", &[], "background"),
            ],
            &[PlatformGroupConfig {
                name: "pool-.*".into(),
                platforms: vec!["vld01".into(), "nutmeg".into()],
            }],
        )
    }

    #[test]
    fn pattern_names_take_the_requested_name() {
        let reg = patterned();
        let nutmeg = &reg.lookup("nutmeg").unwrap()[0];
        assert_eq!(nutmeg.name, "nutmeg");
        assert_eq!(nutmeg.job_runner, "slurm");
        assert_eq!(nutmeg.hosts, ["localhost"]);

        for name in ["vld798", "vld56"] {
            let found = &reg.lookup(name).unwrap()[0];
            assert_eq!(found.hosts, [name]);
            assert_eq!(found.install_target, name);
        }
    }

    #[test]
    fn pattern_must_match_whole_name() {
        let err = patterned().lookup("vld1").unwrap_err();
        assert_eq!(err.code(), "PLATFORM_LOOKUP_ERROR");
        assert!(patterned().lookup("xnutmeg").is_err());
    }

    #[test]
    fn last_matching_definition_wins() {
        // Both "hpc.*" and "h.*" match; "h.*" is defined later.
        let found = &patterned().lookup("hpc2").unwrap()[0];
        assert_eq!(found.name, "hpc2");
        assert_eq!(found.hosts, ["hpc3"]);
    }

    #[test]
    fn group_names_and_members_are_patterns() {
        let names: Vec<_> = patterned()
            .lookup("pool-a")
            .unwrap()
            .iter()
            .map(|p| (p.name.clone(), p.job_runner.clone()))
            .collect();
        assert_eq!(
            names,
            [
                ("vld01".to_string(), "background".to_string()),
                ("nutmeg".to_string(), "slurm".to_string())
            ]
        );
    }

    #[test]
    fn hostless_pattern_serves_matching_host() {
        let reg = patterned();
        assert_eq!(reg.platform_for_host("desktop42", None).unwrap(), "desktop42");
        assert_eq!(reg.platform_for_host("hpc3", None).unwrap(), "h.*");
        assert!(reg.platform_for_host("desktop4", None).is_err());
    }

    #[test]
    fn invalid_pattern_matches_literally() {
        let reg = ConfigRegistry::new(&[platform("odd(name", &["o1"], "background")], &[]);
        assert_eq!(reg.lookup("odd(name").unwrap()[0].hosts, ["o1"]);
        assert!(name_matches("a|b", "b"));
        assert!(!name_matches("a|b", "ab"));
    }

    #[test]
    fn later_definition_wins_for_shared_host() {
        let reg = ConfigRegistry::new(
            &[
                platform("bash-one", &["desktop01"], "background"),
                platform("fish-one", &["desktop01"], "background"),
            ],
            &[],
        );
        assert_eq!(reg.platform_for_host("desktop01", None).unwrap(), "fish-one");
    }
}
