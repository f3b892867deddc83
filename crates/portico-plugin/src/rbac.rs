//! Role-based access control plugin.
//!
//! Permit rules name URIs that require one of a set of roles; users and
//! their roles are looked up by the `user_id` form field. URIs without a
//! permit rule pass freely.

use crate::{Context, Plugin, PluginStatus};
use portico_common::{GatewayError, PermitUrlRule, Result, UserModel};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

const DEFAULT_USER_ID_FIELD: &str = "user_id";
const DEFAULT_USER_ID: &str = "default";

#[derive(Debug)]
pub struct Rbac {
    enabled: AtomicBool,
    user_id_field: String,
    users: RwLock<HashMap<String, UserModel>>,
    url_rules: RwLock<HashMap<String, Vec<String>>>,
}

impl Rbac {
    pub fn new(user_id_field: Option<String>) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            user_id_field: user_id_field.unwrap_or_else(|| DEFAULT_USER_ID_FIELD.to_string()),
            users: RwLock::new(HashMap::new()),
            url_rules: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the user table. Duplicate user ids are a misconfiguration.
    pub fn load_users(&self, users: Vec<UserModel>) -> Result<()> {
        let mut table = HashMap::with_capacity(users.len());
        for user in users {
            if table.contains_key(&user.user_id) {
                return Err(GatewayError::ConfigInvalid(format!(
                    "duplicated user_id: {}",
                    user.user_id
                )));
            }
            table.insert(user.user_id.clone(), user);
        }
        *self.users.write().unwrap_or_else(|e| e.into_inner()) = table;
        Ok(())
    }

    /// Replace the permit-URL table.
    pub fn load_url_rules(&self, rules: Vec<PermitUrlRule>) -> Result<()> {
        let mut table = HashMap::with_capacity(rules.len());
        for rule in rules {
            if rule.roles.is_empty() {
                return Err(GatewayError::ConfigInvalid(format!(
                    "permit rule without roles: {}",
                    rule.uri
                )));
            }
            table.insert(rule.uri, rule.roles);
        }
        *self.url_rules.write().unwrap_or_else(|e| e.into_inner()) = table;
        Ok(())
    }

    /// Whether `user_id` may access `uri`. The second flag reports
    /// whether the URI requires a permission at all.
    fn permit(&self, uri: &str, user_id: &str) -> (bool, bool) {
        let rules = self.url_rules.read().unwrap_or_else(|e| e.into_inner());
        let Some(required) = rules.get(uri) else {
            return (false, false);
        };

        let user_id = if user_id.is_empty() {
            DEFAULT_USER_ID
        } else {
            user_id
        };
        let users = self.users.read().unwrap_or_else(|e| e.into_inner());
        let Some(user) = users.get(user_id) else {
            tracing::warn!(user_id, "unknown user denied");
            return (false, true);
        };

        let permitted = user.roles.iter().any(|role| required.contains(role));
        (permitted, true)
    }
}

impl Plugin for Rbac {
    fn handle(&self, ctx: &mut Context) {
        let user_id = ctx
            .form()
            .get(&self.user_id_field)
            .cloned()
            .unwrap_or_default();
        let (permitted, need) = self.permit(ctx.path(), &user_id);
        if need && !permitted {
            ctx.set_error(GatewayError::NoPermission);
            ctx.abort();
        }
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn status(&self) -> PluginStatus {
        if self.enabled() {
            PluginStatus::Working
        } else {
            PluginStatus::Stopped
        }
    }

    fn name(&self) -> &str {
        "plugin.rbac"
    }

    fn enable(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}
