//! Agent configuration, read from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Agent specializations. Each carries default capabilities and eagerness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentRole {
    File,
    Api,
    Database,
    Git,
    Terminal,
    Test,
    TaskBreakdown,
    GoogleSearch,
    GoogleSheets,
}

impl AgentRole {
    pub const ALL: [AgentRole; 9] = [
        Self::File,
        Self::Api,
        Self::Database,
        Self::Git,
        Self::Terminal,
        Self::Test,
        Self::TaskBreakdown,
        Self::GoogleSearch,
        Self::GoogleSheets,
    ];

    /// Agent type name, also the prefix of generated agent ids.
    pub fn agent_type(&self) -> &'static str {
        match self {
            Self::File => "FileAgent",
            Self::Api => "APIAgent",
            Self::Database => "DatabaseAgent",
            Self::Git => "GitAgent",
            Self::Terminal => "TerminalAgent",
            Self::Test => "TestAgent",
            Self::TaskBreakdown => "TaskBreakdownAgent",
            Self::GoogleSearch => "GoogleSearchAgent",
            Self::GoogleSheets => "GoogleSheetsAgent",
        }
    }

    pub fn default_capabilities(&self) -> &'static [&'static str] {
        match self {
            Self::File => &[
                "file_operations",
                "code_analysis",
                "text_processing",
                "agent_generation",
            ],
            Self::Api => &[
                "api_testing",
                "http_requests",
                "integration_testing",
                "webhook_handling",
            ],
            Self::Database => &[
                "database_operations",
                "sql_queries",
                "migrations",
                "data_management",
            ],
            Self::Git => &["version_control", "git_operations", "repository_management"],
            Self::Terminal => &["command_execution", "system_operations", "cli_navigation"],
            Self::Test => &["test_execution", "test_generation", "quality_assurance"],
            Self::TaskBreakdown => &["task_decomposition", "orchestration", "planning"],
            Self::GoogleSearch => &[
                "web_search",
                "news_search",
                "academic_search",
                "local_search",
            ],
            Self::GoogleSheets => &[
                "spreadsheet_operations",
                "data_analysis",
                "reporting",
                "business_intelligence",
            ],
        }
    }

    /// Minimum fitness (1..=10) this role needs to claim a task.
    pub fn default_eagerness(&self) -> u8 {
        match self {
            Self::File | Self::Database | Self::Git | Self::GoogleSheets => 8,
            Self::Api | Self::Terminal | Self::Test | Self::GoogleSearch => 7,
            Self::TaskBreakdown => 6,
        }
    }

    /// Whether this role plans instead of executing requests.
    pub fn is_planner(&self) -> bool {
        matches!(self, Self::TaskBreakdown)
    }
}

impl FromStr for AgentRole {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        let key = key.strip_suffix("agent").unwrap_or(&key);
        match key {
            "file" => Ok(Self::File),
            "api" => Ok(Self::Api),
            "database" | "db" => Ok(Self::Database),
            "git" => Ok(Self::Git),
            "terminal" | "shell" => Ok(Self::Terminal),
            "test" => Ok(Self::Test),
            "taskbreakdown" | "breakdown" | "planner" => Ok(Self::TaskBreakdown),
            "googlesearch" | "search" => Ok(Self::GoogleSearch),
            "googlesheets" | "sheets" => Ok(Self::GoogleSheets),
            _ => Err(ConfigError::InvalidValue {
                key: "AGENT_ROLE".to_string(),
                message: format!("unknown role '{s}'"),
            }),
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.agent_type())
    }
}

/// Configuration of one agent process.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub role: AgentRole,
    pub agent_id: String,
    pub capabilities: Vec<String>,
    /// Minimum fitness required to claim (1..=10).
    pub eagerness: u8,
    pub workspace_path: PathBuf,
    /// Base poll interval; each sleep adds up to ±0.5 s of jitter.
    pub poll_interval: Duration,
    pub max_concurrent_tasks: usize,
    /// Age after which an unheartbeated claim may be recycled. `None` disables reaping.
    pub lease_timeout: Option<Duration>,
    pub shell_timeout: Duration,
    pub sql_database_path: PathBuf,
    /// Also write daily-rolling log files here.
    pub log_dir: Option<PathBuf>,
}

impl AgentConfig {
    /// Config for `role` with every other setting at its default.
    pub fn for_role(role: AgentRole, workspace_path: impl Into<PathBuf>) -> Self {
        let workspace_path = workspace_path.into();
        Self {
            role,
            agent_id: generate_agent_id(role),
            capabilities: role
                .default_capabilities()
                .iter()
                .map(|c| c.to_string())
                .collect(),
            eagerness: role.default_eagerness(),
            sql_database_path: workspace_path.join("data").join("agent.db"),
            workspace_path,
            poll_interval: Duration::from_secs(2),
            max_concurrent_tasks: 3,
            lease_timeout: None,
            shell_timeout: Duration::from_secs(120),
            log_dir: None,
        }
    }

    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, then validate it.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let role: AgentRole = get("AGENT_ROLE")
            .ok_or_else(|| ConfigError::MissingEnvVar("AGENT_ROLE".to_string()))?
            .parse()?;
        let workspace = get("WORKSPACE_PATH").unwrap_or_else(|| "./workspace".to_string());
        let workspace = std::path::absolute(&workspace).map_err(|e| ConfigError::InvalidValue {
            key: "WORKSPACE_PATH".to_string(),
            message: e.to_string(),
        })?;

        let mut config = Self::for_role(role, workspace);

        if let Some(id) = get("AGENT_ID") {
            config.agent_id = id.trim().to_string();
        }
        if let Some(caps) = get("AGENT_CAPABILITIES") {
            config.capabilities = caps
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(raw) = get("AGENT_EAGERNESS") {
            config.eagerness = parse("AGENT_EAGERNESS", &raw)?;
        }
        if let Some(raw) = get("POLLING_INTERVAL") {
            let secs: f64 = parse("POLLING_INTERVAL", &raw)?;
            config.poll_interval =
                Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
                    key: "POLLING_INTERVAL".to_string(),
                    message: e.to_string(),
                })?;
        }
        if let Some(raw) = get("MAX_CONCURRENT_TASKS") {
            config.max_concurrent_tasks = parse("MAX_CONCURRENT_TASKS", &raw)?;
        }
        if let Some(raw) = get("LEASE_TIMEOUT_SECS") {
            let secs: u64 = parse("LEASE_TIMEOUT_SECS", &raw)?;
            config.lease_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(raw) = get("SHELL_TIMEOUT_SECS") {
            config.shell_timeout = Duration::from_secs(parse("SHELL_TIMEOUT_SECS", &raw)?);
        }
        if let Some(path) = get("SQL_DATABASE_PATH") {
            config.sql_database_path = PathBuf::from(path);
        }
        config.log_dir = get("AGENT_LOG_DIR").map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that every constructor must uphold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=10).contains(&self.eagerness) {
            return Err(invalid("AGENT_EAGERNESS", "must be between 1 and 10"));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(invalid("MAX_CONCURRENT_TASKS", "must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("POLLING_INTERVAL", "must be positive"));
        }
        if self.shell_timeout.is_zero() {
            return Err(invalid("SHELL_TIMEOUT_SECS", "must be positive"));
        }
        if self.agent_id.is_empty() || self.agent_id.contains(['/', '\\']) {
            return Err(invalid("AGENT_ID", "must be non-empty and contain no path separators"));
        }
        // Claims are named `<agent_id>_<task>.json`; dot-files are skipped by scans.
        if self.agent_id.starts_with('.') {
            return Err(invalid("AGENT_ID", "must not start with '.'"));
        }
        Ok(())
    }
}

/// `<AgentType>_<8 hex>`, e.g. `FileAgent_3f9a0c12`.
pub fn generate_agent_id(role: AgentRole) -> String {
    format!("{}_{:08x}", role.agent_type(), rand::random::<u32>())
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}': {e}"),
    })
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn role_parsing_is_lenient() {
        assert_eq!("file".parse::<AgentRole>().unwrap(), AgentRole::File);
        assert_eq!("FileAgent".parse::<AgentRole>().unwrap(), AgentRole::File);
        assert_eq!("APIAgent".parse::<AgentRole>().unwrap(), AgentRole::Api);
        assert_eq!(
            "task_breakdown".parse::<AgentRole>().unwrap(),
            AgentRole::TaskBreakdown
        );
        assert_eq!(
            "TaskBreakdownAgent".parse::<AgentRole>().unwrap(),
            AgentRole::TaskBreakdown
        );
        assert_eq!(
            "google-search-agent".parse::<AgentRole>().unwrap(),
            AgentRole::GoogleSearch
        );
        assert_eq!(
            "GoogleSheetsAgent".parse::<AgentRole>().unwrap(),
            AgentRole::GoogleSheets
        );
        assert!("wizard".parse::<AgentRole>().is_err());
    }

    #[test]
    fn role_defaults() {
        assert_eq!(AgentRole::File.default_eagerness(), 8);
        assert_eq!(AgentRole::Api.default_eagerness(), 7);
        assert_eq!(AgentRole::TaskBreakdown.default_eagerness(), 6);
        assert_eq!(AgentRole::GoogleSheets.default_eagerness(), 8);
        assert_eq!(AgentRole::GoogleSearch.default_eagerness(), 7);
        assert!(AgentRole::Git.default_capabilities().contains(&"git_operations"));
        assert!(AgentRole::GoogleSearch.default_capabilities().contains(&"web_search"));
        for role in AgentRole::ALL {
            assert!(!role.default_capabilities().is_empty());
            assert_eq!(role.to_string().parse::<AgentRole>().unwrap(), role);
        }
    }

    #[test]
    fn missing_role_is_an_error() {
        let err = AgentConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "AGENT_ROLE"));
    }

    #[test]
    fn defaults_from_role() {
        let config = AgentConfig::from_lookup(lookup(&[("AGENT_ROLE", "git")])).unwrap();
        assert_eq!(config.eagerness, 8);
        assert_eq!(config.max_concurrent_tasks, 3);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert!(config.lease_timeout.is_none());
        assert!(config.agent_id.starts_with("GitAgent_"));
        assert_eq!(config.agent_id.len(), "GitAgent_".len() + 8);
        assert!(config.workspace_path.is_absolute());
        assert!(config.workspace_path.ends_with("workspace"));
        assert_eq!(
            config.sql_database_path,
            config.workspace_path.join("data/agent.db")
        );
    }

    #[test]
    fn overrides() {
        let config = AgentConfig::from_lookup(lookup(&[
            ("AGENT_ROLE", "database"),
            ("AGENT_ID", "db-1"),
            ("AGENT_CAPABILITIES", "sql_queries, migrations,"),
            ("AGENT_EAGERNESS", "4"),
            ("POLLING_INTERVAL", "0.5"),
            ("MAX_CONCURRENT_TASKS", "1"),
            ("LEASE_TIMEOUT_SECS", "300"),
            ("WORKSPACE_PATH", "/srv/hive"),
        ]))
        .unwrap();
        assert_eq!(config.agent_id, "db-1");
        assert_eq!(config.capabilities, vec!["sql_queries", "migrations"]);
        assert_eq!(config.eagerness, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.max_concurrent_tasks, 1);
        assert_eq!(config.lease_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.workspace_path, PathBuf::from("/srv/hive"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for (key, value) in [
            ("AGENT_EAGERNESS", "11"),
            ("AGENT_EAGERNESS", "0"),
            ("AGENT_EAGERNESS", "high"),
            ("MAX_CONCURRENT_TASKS", "0"),
            ("POLLING_INTERVAL", "0"),
            ("POLLING_INTERVAL", "-1"),
            ("AGENT_ID", "a/b"),
            ("AGENT_ID", ".hidden"),
        ] {
            let result = AgentConfig::from_lookup(lookup(&[("AGENT_ROLE", "file"), (key, value)]));
            assert!(
                matches!(result, Err(ConfigError::InvalidValue { .. })),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn zero_lease_timeout_disables_reaping() {
        let config = AgentConfig::from_lookup(lookup(&[
            ("AGENT_ROLE", "file"),
            ("LEASE_TIMEOUT_SECS", "0"),
        ]))
        .unwrap();
        assert!(config.lease_timeout.is_none());
    }
}
