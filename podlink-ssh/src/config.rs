//! `ssh_config(5)` parsing and `ProxyJump` chasing (spec §6 "SSH
//! configuration"), grounded on `pkg/util/ssh.go`'s `confList` /
//! `jumpRecursion` / `getBastion`.

use once_cell::sync::OnceCell;
use podlink_core::error::CoreError;
use ssh2_config::{ParseRule, SshConfig as RawSshConfig};
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Mutex;

/// One hop's resolved connection parameters, after merging
/// `~/.ssh/config` and `/etc/ssh/ssh_config` (user file wins) and
/// substituting defaults for `Port` and `IdentityFile`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BastionConfig {
    pub alias: String,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub identity_file: PathBuf,
    pub proxy_jump: Option<String>,
}

pub(crate) fn home_dir() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/"))
}

fn default_identity_file() -> PathBuf {
    home_dir().join(".ssh").join("id_rsa")
}

/// Parses the two conventional ssh_config locations. The user's file
/// is queried first and only falls through to the system file for
/// aliases it doesn't match, since `SshConfig::query` has no merge
/// operation of its own. The result is cached for the process
/// lifetime, mirroring Go's `sync.Once`-guarded `confList`.
fn merged_config() -> &'static [RawSshConfig] {
    static CONFIGS: OnceCell<Vec<RawSshConfig>> = OnceCell::new();
    CONFIGS.get_or_init(|| {
        [home_dir().join(".ssh").join("config"), PathBuf::from("/etc/ssh/ssh_config")]
            .into_iter()
            .filter_map(|path| {
                let file = std::fs::File::open(&path).ok()?;
                let mut reader = BufReader::new(file);
                RawSshConfig::default().parse(&mut reader, ParseRule::STRICT).ok()
            })
            .collect()
    })
}

/// Resolves one alias's parameters, the equivalent of `getBastion`.
/// Consults the user's `~/.ssh/config` before `/etc/ssh/ssh_config`
/// and stops at the first file with an explicit match for `alias`, so
/// a user override always takes precedence over the system default.
pub fn resolve_alias(alias: &str) -> BastionConfig {
    let configs = merged_config();
    let queried: Vec<_> = configs.iter().map(|c| c.query(alias)).collect();
    let params = queried
        .iter()
        .find(|p| p.host_name.is_some() || p.user.is_some() || !p.proxy_jump.is_empty())
        .or_else(|| queried.first());

    let Some(params) = params else {
        return BastionConfig {
            alias: alias.to_string(),
            host: alias.to_string(),
            port: 22,
            user: None,
            identity_file: default_identity_file(),
            proxy_jump: None,
        };
    };
    BastionConfig {
        alias: alias.to_string(),
        host: params.host_name.clone().unwrap_or_else(|| alias.to_string()),
        port: params.port.unwrap_or(22),
        user: params.user.clone(),
        identity_file: params
            .identity_file
            .as_ref()
            .and_then(|files| files.first().cloned())
            .unwrap_or_else(default_identity_file),
        proxy_jump: params.proxy_jump.first().cloned(),
    }
}

/// Walks `ProxyJump` directives from `alias` back to the outermost
/// bastion, returning hops in dial order (outermost first), the
/// equivalent of `jumpRecursion`'s `bastionList` walk plus its
/// reverse-order dial loop.
pub fn resolve_jump_chain(alias: &str) -> Vec<BastionConfig> {
    let mut chain = vec![resolve_alias(alias)];
    let mut current = alias.to_string();
    loop {
        let next = chain.last().and_then(|c| c.proxy_jump.clone());
        match next {
            Some(next_alias) if next_alias != current => {
                current = next_alias.clone();
                chain.push(resolve_alias(&next_alias));
            }
            _ => break,
        }
    }
    chain.reverse();
    chain
}

/// Per-alias resolved-parameter cache, avoiding re-parsing the merged
/// config file on repeated dials of the same alias.
static ALIAS_CACHE: Mutex<Option<std::collections::HashMap<String, BastionConfig>>> = Mutex::new(None);

pub fn resolve_alias_cached(alias: &str) -> Result<BastionConfig, CoreError> {
    let mut guard = ALIAS_CACHE.lock().map_err(|_| CoreError::fatal("ssh alias cache poisoned"))?;
    let cache = guard.get_or_insert_with(std::collections::HashMap::new);
    if let Some(found) = cache.get(alias) {
        return Ok(found.clone());
    }
    let resolved = resolve_alias(alias);
    cache.insert(alias.to_string(), resolved.clone());
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_alias_falls_back_to_alias_as_hostname() {
        let cfg = resolve_alias("no-such-host-alias-in-any-config");
        assert_eq!(cfg.host, "no-such-host-alias-in-any-config");
        assert_eq!(cfg.port, 22);
        assert_eq!(cfg.identity_file, default_identity_file());
    }

    #[test]
    fn jump_chain_with_no_proxy_jump_is_single_hop() {
        let chain = resolve_jump_chain("plain-alias-without-jump");
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].alias, "plain-alias-without-jump");
    }
}
