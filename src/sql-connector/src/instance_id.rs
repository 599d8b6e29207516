// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Parsing and validation of Cloud SQL instance connection names.

use crate::error::ConnectorError;

/// A parsed instance connection name: `project[:subproject]:region:instance`.
///
/// Domain-scoped legacy projects carry one embedded colon, e.g.
/// `example.com:my-project:us-central1:my-db` parses to
/// `project == "example.com:my-project"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceId {
    project: String,
    region: String,
    instance: String,
}

impl InstanceId {
    /// Parses a connection name of the form `project[:subproject]:region:instance`.
    ///
    /// Returns [`ConnectorError::InvalidIdentifier`] if `name` does not
    /// contain exactly two or three colon-delimited components.
    pub fn parse(name: &str) -> Result<Self, ConnectorError> {
        let parts: Vec<&str> = name.split(':').collect();
        let (project, region, instance) = match parts.as_slice() {
            [project, region, instance] => (project.to_string(), region.to_string(), instance.to_string()),
            [domain, project, region, instance] => (
                format!("{domain}:{project}"),
                region.to_string(),
                instance.to_string(),
            ),
            _ => {
                return Err(ConnectorError::InvalidIdentifier {
                    name: name.to_string(),
                    reason: "expected project:region:instance or domain:project:region:instance"
                        .to_string(),
                });
            }
        };

        if project.is_empty() || region.is_empty() || instance.is_empty() {
            return Err(ConnectorError::InvalidIdentifier {
                name: name.to_string(),
                reason: "project, region, and instance must all be non-empty".to_string(),
            });
        }

        Ok(InstanceId {
            project,
            region,
            instance,
        })
    }

    /// The project id, possibly `domain:project` for legacy domain-scoped projects.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// The region, e.g. `us-central1`.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// The instance name within the project and region.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// `region~instance`, the admin-API resource path segment for this instance.
    pub fn regional_instance(&self) -> String {
        format!("{}~{}", self.region, self.instance)
    }

    /// The original `project:region:instance` (or domain-scoped) form.
    pub fn connection_name(&self) -> String {
        format!("{}:{}:{}", self.project, self.region, self.instance)
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.connection_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_identifier() {
        let id = InstanceId::parse("my-proj:us-central1:db1").unwrap();
        assert_eq!(id.project(), "my-proj");
        assert_eq!(id.region(), "us-central1");
        assert_eq!(id.instance(), "db1");
        assert_eq!(id.regional_instance(), "us-central1~db1");
        assert_eq!(id.connection_name(), "my-proj:us-central1:db1");
    }

    #[test]
    fn parses_domain_scoped_identifier() {
        let id = InstanceId::parse("example.com:proj:us-east1:db2").unwrap();
        assert_eq!(id.project(), "example.com:proj");
        assert_eq!(id.region(), "us-east1");
        assert_eq!(id.instance(), "db2");
    }

    #[test]
    fn rejects_too_few_components() {
        let err = InstanceId::parse("only-one-part").unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidIdentifier { .. }));
    }

    #[test]
    fn rejects_too_many_components() {
        let err = InstanceId::parse("a:b:c:d:e").unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidIdentifier { .. }));
    }

    #[test]
    fn rejects_empty_components() {
        assert!(InstanceId::parse("::db1").is_err());
        assert!(InstanceId::parse("proj::db1").is_err());
        assert!(InstanceId::parse("proj:us-central1:").is_err());
    }

    proptest::proptest! {
        #[test]
        fn round_trips_simple_identifiers(
            project in "[a-z][a-z0-9-]{2,20}",
            region in "[a-z][a-z0-9-]{2,20}",
            instance in "[a-z][a-z0-9-]{2,20}",
        ) {
            let name = format!("{project}:{region}:{instance}");
            let id = InstanceId::parse(&name).unwrap();
            proptest::prop_assert_eq!(id.connection_name(), name);
            proptest::prop_assert_eq!(id.project(), project);
            proptest::prop_assert_eq!(id.region(), region);
            proptest::prop_assert_eq!(id.instance(), instance);
        }
    }
}
