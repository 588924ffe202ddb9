//! Cluster role planning.
//!
//! Role assignment is purely positional over the deterministic working
//! host set: the first `server_nodes` hosts get `{client, server}`, the
//! rest `{client}`. The planner never elects or reaches consensus; the
//! consul-server race is resolved later at the database.

use std::collections::HashMap;

use runner_core::config::Server;
use runner_core::store::HostRole;

/// A role a host plays in the orchestration layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterRole {
    Client,
    Server,
}

/// Positional role plan for a fleet.
#[derive(Debug)]
pub struct ClusterPlanner {
    total_nodes: usize,
    server_nodes: usize,
    role_mapping: HashMap<String, Vec<ClusterRole>>,
}

impl ClusterPlanner {
    /// Derive the server-node count from the full working host set:
    /// one server for fleets of one or two, otherwise all but one host.
    pub fn new(all_hosts: &[Server]) -> Self {
        let total_nodes = all_hosts.len();
        let server_nodes = match total_nodes {
            0 => 0,
            1 | 2 => 1,
            n => n - 1,
        };

        Self {
            total_nodes,
            server_nodes,
            role_mapping: HashMap::new(),
        }
    }

    /// Assign roles to the configured hosts, in input order.
    pub fn calculate_roles(&mut self, hosts: &[Server]) {
        for (index, host) in hosts.iter().enumerate() {
            let mut roles = vec![ClusterRole::Client];
            if index < self.server_nodes {
                roles.push(ClusterRole::Server);
            }
            self.role_mapping.insert(host.host.clone(), roles);
        }
    }

    /// Roles assigned to a host; empty when the host is unknown.
    pub fn roles_for(&self, host: &str) -> &[ClusterRole] {
        self.role_mapping
            .get(host)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub const fn total_nodes(&self) -> usize {
        self.total_nodes
    }

    /// How many hosts carry the server role.
    pub const fn server_nodes(&self) -> usize {
        self.server_nodes
    }
}

/// Collapse a role set into the persisted column value.
pub fn persisted_role(roles: &[ClusterRole]) -> HostRole {
    if roles.len() > 1 {
        HostRole::Both
    } else {
        HostRole::Client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_core::config::AuthMethod;

    fn hosts(n: usize) -> Vec<Server> {
        (0..n)
            .map(|i| Server {
                host: format!("h{i}"),
                username: "root".to_string(),
                key_path: None,
                region: "eu".to_string(),
                public_ip: format!("1.1.1.{i}"),
                private_ip: format!("10.0.0.{i}"),
                auth_method: AuthMethod::KeyPath,
            })
            .collect()
    }

    fn planned(n: usize) -> ClusterPlanner {
        let fleet = hosts(n);
        let mut planner = ClusterPlanner::new(&fleet);
        planner.calculate_roles(&fleet);
        planner
    }

    #[test]
    fn single_host_is_server_and_client() {
        let planner = planned(1);
        assert_eq!(planner.server_nodes(), 1);
        assert_eq!(
            planner.roles_for("h0"),
            &[ClusterRole::Client, ClusterRole::Server]
        );
    }

    #[test]
    fn two_hosts_have_one_server() {
        let planner = planned(2);
        assert_eq!(planner.server_nodes(), 1);
        assert_eq!(
            planner.roles_for("h0"),
            &[ClusterRole::Client, ClusterRole::Server]
        );
        assert_eq!(planner.roles_for("h1"), &[ClusterRole::Client]);
    }

    #[test]
    fn three_hosts_have_two_servers() {
        let planner = planned(3);
        assert_eq!(planner.server_nodes(), 2);
        assert_eq!(
            planner.roles_for("h0"),
            &[ClusterRole::Client, ClusterRole::Server]
        );
        assert_eq!(
            planner.roles_for("h1"),
            &[ClusterRole::Client, ClusterRole::Server]
        );
        assert_eq!(planner.roles_for("h2"), &[ClusterRole::Client]);
    }

    #[test]
    fn five_hosts_have_four_servers() {
        let planner = planned(5);
        assert_eq!(planner.server_nodes(), 4);
        assert_eq!(planner.roles_for("h4"), &[ClusterRole::Client]);
    }

    #[test]
    fn identical_inputs_give_identical_plans() {
        let a = planned(4);
        let b = planned(4);
        for i in 0..4 {
            let host = format!("h{i}");
            assert_eq!(a.roles_for(&host), b.roles_for(&host));
        }
    }

    #[test]
    fn unknown_host_has_no_roles() {
        let planner = planned(2);
        assert!(planner.roles_for("missing").is_empty());
    }

    #[test]
    fn persisted_role_collapses_role_sets() {
        use runner_core::store::HostRole;
        assert_eq!(persisted_role(&[ClusterRole::Client]), HostRole::Client);
        assert_eq!(
            persisted_role(&[ClusterRole::Client, ClusterRole::Server]),
            HostRole::Both
        );
    }
}
