//! Builder for PowerShell command lines

use anyhow::Context;
use serde::de::DeserializeOwned;
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::Command;

/// Quote a string as a PowerShell single-quoted literal
pub fn ps_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub fn ps_bool(b: bool) -> &'static str {
    if b {
        "$true"
    } else {
        "$false"
    }
}

/// Parse `ConvertTo-Json` output, which is empty for no objects, a bare
/// object for one, and an array for several.
pub fn parse_json_list<T: DeserializeOwned>(out: &str) -> anyhow::Result<Vec<T>> {
    let out = out.trim();
    if out.is_empty() {
        return Ok(Vec::new());
    }
    if out.starts_with('[') {
        serde_json::from_str(out).context("unexpected powershell json")
    } else {
        Ok(vec![serde_json::from_str(out).context("unexpected powershell json")?])
    }
}

/// Non-empty trimmed lines of cmdlet output
pub fn output_lines(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// A PowerShell script builder
pub struct PowerShellBuilder(Command);

impl PowerShellBuilder {
    pub fn new(program: &Path) -> Self {
        let mut cmd = Command::new(program);
        cmd.args(["-NoProfile", "-NonInteractive", "-Command"]);
        Self(cmd)
    }

    /// Start a new cmdlet
    pub fn cmdlet<S: AsRef<OsStr>>(mut self, cmdlet: S) -> PowerShellCmdletBuilder {
        self.0.arg(cmdlet);
        PowerShellCmdletBuilder(self.0)
    }

    /// Append a literal script fragment
    pub fn script<S: AsRef<OsStr>>(mut self, script: S) -> Self {
        self.0.arg(script);
        self
    }

    pub fn run(mut self) -> anyhow::Result<()> {
        let output = self.0.output().context("failed to launch powershell")?;
        if !output.status.success() {
            anyhow::bail!(
                "powershell failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Run the script and return its stdout
    pub fn output(mut self) -> anyhow::Result<String> {
        let output = self.0.output().context("failed to launch powershell")?;
        if !output.status.success() {
            anyhow::bail!(
                "powershell failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        String::from_utf8(output.stdout).context("powershell output is not utf-8")
    }

    pub fn args(&self) -> Vec<String> {
        self.0
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

/// A PowerShell cmdlet builder
pub struct PowerShellCmdletBuilder(Command);

impl PowerShellCmdletBuilder {
    pub fn flag<S: AsRef<OsStr>>(mut self, flag: S) -> Self {
        let mut arg = OsString::from("-");
        arg.push(flag);
        self.0.arg(arg);
        self
    }

    pub fn flag_opt<S: AsRef<OsStr>>(self, flag: Option<S>) -> Self {
        if let Some(flag) = flag {
            self.flag(flag)
        } else {
            self
        }
    }

    /// Add a named argument with a quoted string value
    pub fn arg<S: AsRef<OsStr>>(self, name: S, value: &str) -> Self {
        self.arg_raw(name, ps_quote(value))
    }

    pub fn arg_path<S: AsRef<OsStr>>(self, name: S, value: &Path) -> Self {
        self.arg(name, &value.to_string_lossy())
    }

    pub fn arg_opt<S: AsRef<OsStr>>(self, name: S, value: Option<&str>) -> Self {
        if let Some(value) = value {
            self.arg(name, value)
        } else {
            self
        }
    }

    /// Add a named argument whose value is passed through unquoted
    pub fn arg_raw<S: AsRef<OsStr>, T: AsRef<OsStr>>(mut self, name: S, value: T) -> Self {
        self = self.flag(name);
        self.0.arg(value);
        self
    }

    pub fn arg_string<S: AsRef<OsStr>, T: ToString>(self, name: S, value: T) -> Self {
        self.arg_raw(name, value.to_string())
    }

    pub fn arg_opt_string<S: AsRef<OsStr>, T: ToString>(self, name: S, value: Option<T>) -> Self {
        if let Some(value) = value {
            self.arg_string(name, value)
        } else {
            self
        }
    }

    /// Ignore "not found" errors from Get-* cmdlets
    pub fn silently(self) -> Self {
        self.arg_raw("ErrorAction", "SilentlyContinue")
    }

    pub fn finish(self) -> PowerShellBuilder {
        PowerShellBuilder(self.0)
    }

    /// Finish the cmdlet with a pipeline operator
    pub fn pipeline(mut self) -> PowerShellBuilder {
        self.0.arg("|");
        self.finish()
    }

    /// Pipe into `Select-Object -ExpandProperty`
    pub fn expand_property(self, property: &str) -> PowerShellBuilder {
        self.pipeline()
            .cmdlet("Select-Object")
            .arg_raw("ExpandProperty", property)
            .finish()
    }

    /// Pipe into `Select-Object` and `ConvertTo-Json`
    pub fn select_json(self, properties: &str) -> PowerShellBuilder {
        self.pipeline()
            .cmdlet("Select-Object")
            .positional(properties)
            .pipeline()
            .cmdlet("ConvertTo-Json")
            .flag("Compress")
            .finish()
    }

    pub fn positional<S: AsRef<OsStr>>(mut self, positional: S) -> Self {
        self.0.arg(positional);
        self
    }
}
