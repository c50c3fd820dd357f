use serde_json::{Map, Value, json};

pub const RESOURCE_MANAGER_URL: &str = "https://cloudresourcemanager.googleapis.com";

/// SecOps roles reported when an IAM audit does not list its own.
pub const TARGET_ROLES: &[&str] = &[
    "roles/chronicle.viewer",
    "roles/chronicle.editor",
    "roles/chronicle.admin",
    "roles/chronicle.federationAdmin",
    "roles/chronicle.federationViewer",
    "roles/chronicle.globalDataAccess",
    "roles/chronicle.limitedViewer",
    "roles/chronicle.restrictedDataAccess",
    "roles/chronicle.restrictedDataAccessViewer",
    "roles/chronicle.serviceAgent",
    "roles/chronicle.soarAdmin",
    "roles/chronicle.soarAnalyst",
    "roles/chronicle.soarEngineer",
    "roles/chronicle.soarServiceAgent",
    "roles/chronicle.soarThreatManager",
    "roles/chronicle.soarViewer",
    "roles/chronicle.soarVulnerabilityManager",
];

pub fn policy_path(project_id: &str) -> String {
    format!("v1/projects/{}:getIamPolicy", project_id)
}

/// Reduce a `getIamPolicy` response to `{"roles": {role: [members]}}`.
///
/// Every requested role appears in the output, bound or not.
pub fn reduce_policy(project_id: &str, policy: &Value, roles: &[String]) -> Value {
    let wanted: Vec<String> = if roles.is_empty() {
        TARGET_ROLES.iter().map(|r| r.to_string()).collect()
    } else {
        roles.to_vec()
    };

    let mut by_role: Map<String, Value> = wanted
        .iter()
        .map(|role| (role.clone(), Value::Array(Vec::new())))
        .collect();

    let bindings = policy
        .get("bindings")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    if bindings.is_empty() {
        return json!({
            "message": format!("No IAM bindings found for project {}.", project_id),
            "roles": by_role,
        });
    }

    for binding in &bindings {
        let Some(role) = binding.get("role").and_then(Value::as_str) else {
            continue;
        };
        if let Some(Value::Array(members)) = by_role.get_mut(role)
            && let Some(new_members) = binding.get("members").and_then(Value::as_array)
        {
            members.extend(new_members.iter().cloned());
        }
    }

    json!({ "roles": by_role })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_requested_roles_and_lists_unbound_ones() {
        let policy = json!({
            "bindings": [
                {"role": "roles/chronicle.admin", "members": ["user:a@x.io"]},
                {"role": "roles/owner", "members": ["user:root@x.io"]},
                {"role": "roles/chronicle.admin", "members": ["group:sec@x.io"]}
            ]
        });
        let roles = vec!["roles/chronicle.admin".to_string(), "roles/chronicle.viewer".to_string()];
        let reduced = reduce_policy("p1", &policy, &roles);
        assert_eq!(
            reduced,
            json!({"roles": {
                "roles/chronicle.admin": ["user:a@x.io", "group:sec@x.io"],
                "roles/chronicle.viewer": []
            }})
        );
    }

    #[test]
    fn empty_policy_uses_builtin_roles_and_explains() {
        let reduced = reduce_policy("p1", &json!({}), &[]);
        assert_eq!(reduced["message"], "No IAM bindings found for project p1.");
        assert_eq!(reduced["roles"].as_object().unwrap().len(), TARGET_ROLES.len());
    }
}
