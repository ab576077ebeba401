use std::collections::HashSet;
use std::path::PathBuf;

use clap::Parser;

use crate::error::OrchestratorError;
use crate::types::ExecutorVariant;

const DEFAULT_LIMIT: u32 = 20;
const CONCURRENCY_ENV_VAR: &str = "CLAUDIOMIRO_CONCURRENCY";

/// CLI flags. Executor selection is mutually exclusive and defaults to
/// `claude`; `--backend`/`--frontend` must be supplied together.
#[derive(Parser, Debug, Clone)]
#[command(name = "claudiomiro", about = "DAG executor for AI-assisted code-change tasks")]
pub struct Cli {
    /// Workspace folder to operate in. Defaults to the current directory.
    #[arg(default_value = ".")]
    pub folder: PathBuf,

    #[arg(long)]
    pub codex: bool,
    #[arg(long)]
    pub gemini: bool,
    #[arg(long = "deep-seek")]
    pub deep_seek: bool,
    #[arg(long)]
    pub glm: bool,

    /// Remove the task-executor state directory, preserving `insights/`.
    #[arg(long)]
    pub fresh: bool,

    /// Resume from a prior run.
    #[arg(long = "continue")]
    pub resume: bool,

    /// Comma-separated phase numbers to restrict execution to (4,5,6,7).
    #[arg(long)]
    pub steps: Option<String>,

    #[arg(long)]
    pub backend: Option<PathBuf>,
    #[arg(long)]
    pub frontend: Option<PathBuf>,

    #[arg(long = "legacy-system")]
    pub legacy_system: Option<PathBuf>,
    #[arg(long = "legacy-backend")]
    pub legacy_backend: Option<PathBuf>,
    #[arg(long = "legacy-frontend")]
    pub legacy_frontend: Option<PathBuf>,

    /// Disable the review phase's push side effect.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub push: bool,

    /// Remove the per-task attempt cap.
    #[arg(long = "no-limit")]
    pub no_limit: bool,

    /// Per-task attempt cap (default 20).
    #[arg(long, default_value_t = DEFAULT_LIMIT)]
    pub limit: u32,

    #[arg(long)]
    pub verbose: bool,
    #[arg(long)]
    pub quiet: bool,
}

impl Cli {
    /// Resolve the mutually-exclusive executor flags to a single variant,
    /// defaulting to `claude` when none are set.
    pub fn executor_variant(&self) -> Result<ExecutorVariant, OrchestratorError> {
        let chosen: Vec<(&str, bool)> = vec![
            ("codex", self.codex),
            ("gemini", self.gemini),
            ("deep-seek", self.deep_seek),
            ("glm", self.glm),
        ];
        let selected: Vec<&str> = chosen.into_iter().filter(|(_, v)| *v).map(|(n, _)| n).collect();
        match selected.as_slice() {
            [] => Ok(ExecutorVariant::Claude),
            [one] => crate::types::parse_executor_variant(one).map_err(OrchestratorError::InvalidInput),
            _ => Err(OrchestratorError::InvalidInput(
                "executor flags are mutually exclusive".to_string(),
            )),
        }
    }

    /// Parse `--steps=<csv>` into the Phase Runner's allowed-phase set.
    /// `None` is returned when the flag was not supplied (every phase runs).
    pub fn allowed_phases(&self) -> Result<Option<HashSet<u8>>, OrchestratorError> {
        let Some(csv) = &self.steps else {
            return Ok(None);
        };
        let mut phases = HashSet::new();
        for part in csv.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let n: u8 = part
                .parse()
                .map_err(|_| OrchestratorError::InvalidInput(format!("invalid step number: {}", part)))?;
            phases.insert(n);
        }
        Ok(Some(phases))
    }

    /// Per-task attempt cap: `None` when `--no-limit` is set, else `--limit`.
    pub fn max_attempts(&self) -> Option<u32> {
        if self.no_limit {
            None
        } else {
            Some(self.limit)
        }
    }

    /// `--backend`/`--frontend` must be supplied together.
    pub fn validate_multi_repo_pair(&self) -> Result<(), OrchestratorError> {
        match (&self.backend, &self.frontend) {
            (Some(_), Some(_)) | (None, None) => Ok(()),
            _ => Err(OrchestratorError::InvalidInput(
                "--backend and --frontend must be supplied together".to_string(),
            )),
        }
    }
}

/// The default concurrency cap (CPU count × 2), overridable by
/// `CLAUDIOMIRO_CONCURRENCY`. Grounded on the cross-pack convention of
/// deriving a concurrency default from `num_cpus::get()` rather than rolling
/// a bespoke core-count probe.
pub fn default_max_concurrent() -> u32 {
    if let Ok(raw) = std::env::var(CONCURRENCY_ENV_VAR) {
        if let Ok(parsed) = raw.trim().parse::<u32>() {
            if parsed > 0 {
                return parsed;
            }
        }
    }
    (num_cpus::get() as u32).saturating_mul(2).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut full = vec!["claudiomiro"];
        full.extend_from_slice(args);
        Cli::parse_from(full)
    }

    #[test]
    fn defaults_to_claude_executor() {
        let cli = parse(&[]);
        assert_eq!(cli.executor_variant().unwrap(), ExecutorVariant::Claude);
    }

    #[test]
    fn selects_single_executor_flag() {
        let cli = parse(&["--gemini"]);
        assert_eq!(cli.executor_variant().unwrap(), ExecutorVariant::Gemini);
    }

    #[test]
    fn rejects_multiple_executor_flags() {
        let cli = parse(&["--gemini", "--codex"]);
        assert!(cli.executor_variant().is_err());
    }

    #[test]
    fn parses_steps_csv() {
        let cli = parse(&["--steps=4,5, 6"]);
        let phases = cli.allowed_phases().unwrap().unwrap();
        assert_eq!(phases, HashSet::from([4, 5, 6]));
    }

    #[test]
    fn no_steps_flag_allows_everything() {
        let cli = parse(&[]);
        assert!(cli.allowed_phases().unwrap().is_none());
    }

    #[test]
    fn no_limit_overrides_limit() {
        let cli = parse(&["--no-limit"]);
        assert_eq!(cli.max_attempts(), None);

        let cli = parse(&["--limit=5"]);
        assert_eq!(cli.max_attempts(), Some(5));

        let cli = parse(&[]);
        assert_eq!(cli.max_attempts(), Some(DEFAULT_LIMIT));
    }

    #[test]
    fn backend_and_frontend_must_be_paired() {
        let cli = parse(&["--backend=/b"]);
        assert!(cli.validate_multi_repo_pair().is_err());

        let cli = parse(&["--backend=/b", "--frontend=/f"]);
        assert!(cli.validate_multi_repo_pair().is_ok());

        let cli = parse(&[]);
        assert!(cli.validate_multi_repo_pair().is_ok());
    }

    #[test]
    fn concurrency_env_override_wins_over_cpu_default() {
        std::env::set_var(CONCURRENCY_ENV_VAR, "7");
        assert_eq!(default_max_concurrent(), 7);
        std::env::remove_var(CONCURRENCY_ENV_VAR);
    }
}
