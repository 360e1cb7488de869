use std::collections::HashMap;
use std::time::Duration;

/// One engine invocation: subcommand, arguments, and the environment the
/// child receives. The global `--json` flag is always present so stdout can
/// be parsed line-by-line.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineRequest {
    subcommand: String,
    repository: Option<String>,
    args: Vec<String>,
    env: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

impl EngineRequest {
    pub fn new(subcommand: impl Into<String>) -> Self {
        Self {
            subcommand: subcommand.into(),
            repository: None,
            args: Vec::new(),
            env: HashMap::new(),
            timeout: None,
        }
    }

    pub fn repository(mut self, uri: impl Into<String>) -> Self {
        self.repository = Some(uri.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &HashMap<String, String>) -> Self {
        for (k, v) in vars {
            self.env.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn subcommand_name(&self) -> &str {
        &self.subcommand
    }

    /// Full argv, engine binary excluded: global flags, repository, then the
    /// subcommand and its arguments.
    pub fn to_argv(&self) -> Vec<String> {
        let mut argv = vec!["--json".to_string()];
        if let Some(repo) = &self.repository {
            argv.push("-r".to_string());
            argv.push(repo.clone());
        }
        argv.push(self.subcommand.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Environment for the child, built from scratch rather than inherited:
    /// a minimal passthrough set plus the request's own variables
    /// (`RESTIC_PASSWORD`, backend credentials). Secrets from the parent
    /// environment never leak through.
    pub fn scrubbed_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        for key in ["PATH", "HOME", "TMPDIR", "TEMP", "TMP"] {
            if let Ok(value) = std::env::var(key) {
                env.insert(key.to_string(), value);
            }
        }
        for (k, v) in &self.env {
            env.insert(k.clone(), v.clone());
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_puts_json_first_and_subcommand_after_repo() {
        let request = EngineRequest::new("backup")
            .repository("file:///tmp/r")
            .arg("/data")
            .arg("--tag")
            .arg("nightly");
        assert_eq!(
            request.to_argv(),
            vec!["--json", "-r", "file:///tmp/r", "backup", "/data", "--tag", "nightly"]
        );
    }

    #[test]
    fn argv_without_repository() {
        let request = EngineRequest::new("version");
        assert_eq!(request.to_argv(), vec!["--json", "version"]);
    }

    #[test]
    fn scrubbed_env_keeps_request_vars_and_drops_parent_secrets() {
        std::env::set_var("TIMELOCKER_TEST_SECRET", "leak-me-not");
        let request = EngineRequest::new("backup").env("RESTIC_PASSWORD", "pw");
        let env = request.scrubbed_env();
        assert_eq!(env.get("RESTIC_PASSWORD").map(String::as_str), Some("pw"));
        assert!(!env.contains_key("TIMELOCKER_TEST_SECRET"));
        std::env::remove_var("TIMELOCKER_TEST_SECRET");
    }
}
