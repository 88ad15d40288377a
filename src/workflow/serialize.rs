//! Workflow export/import.
//!
//! The export is plain JSON with a stable shape, version-gated so older
//! readers fail loudly. Import reconstructs nodes through a caller-supplied
//! [`NodeTypeRegistry`]: behaviors and schemas come from the registered
//! factories, while identity, ports, and configuration come from the stored
//! form. Configuration is reapplied via `setup`, so schemas re-validate.

use crate::data::{DataRecord, NodeOutput};
use crate::error::{FlowError, FlowResult};
use crate::node::{FlowNode, LinkType, NodeProperties, Port};
use crate::workflow::{Link, Workflow, WorkflowSettings};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// The export format version this crate reads and writes
pub const EXPORT_VERSION: u32 = 1;

/// Serialized form of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExport {
    /// Format version; always [`EXPORT_VERSION`]
    pub version: u32,
    /// Workflow id
    pub id: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Nodes in insertion order
    pub nodes: Vec<NodeExport>,
    /// source name -> target input port -> link endpoints
    pub links_by_source: BTreeMap<String, BTreeMap<String, Vec<LinkEndpoint>>>,
    /// Workflow settings
    #[serde(default)]
    pub settings: WorkflowSettings,
    /// Workflow-scoped static data
    #[serde(default)]
    pub static_data: DataRecord,
    /// Mocked node outputs, when configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_data: Option<HashMap<String, NodeOutput>>,
}

/// Serialized form of one node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExport {
    /// Identity and scheduling options
    pub properties: NodeProperties,
    /// Accumulated configuration
    #[serde(default)]
    pub config: DataRecord,
    /// Input ports
    #[serde(default)]
    pub inputs: Vec<Port>,
    /// Output ports
    #[serde(default)]
    pub outputs: Vec<Port>,
    /// Free-form note
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
}

/// The target half of a serialized link
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkEndpoint {
    /// Node receiving the data
    pub target_node: String,
    /// Output port on the source feeding this link
    pub output_port_name: String,
    /// Link interpretation
    #[serde(default)]
    pub link_type: LinkType,
}

/// Creates nodes for stored `nodeType`/`version` pairs on import
#[derive(Default)]
pub struct NodeTypeRegistry {
    factories: HashMap<(String, u32), Box<dyn Fn() -> FlowResult<FlowNode> + Send + Sync>>,
}

impl std::fmt::Debug for NodeTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTypeRegistry")
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl NodeTypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a node type and version
    pub fn register<T, F>(&mut self, node_type: T, version: u32, factory: F)
    where
        T: Into<String>,
        F: Fn() -> FlowResult<FlowNode> + Send + Sync + 'static,
    {
        self.factories
            .insert((node_type.into(), version), Box::new(factory));
    }

    /// Whether a type/version pair is registered
    pub fn contains(&self, node_type: &str, version: u32) -> bool {
        self.factories
            .contains_key(&(node_type.to_string(), version))
    }

    fn create(&self, node_type: &str, version: u32) -> FlowResult<FlowNode> {
        let factory = self
            .factories
            .get(&(node_type.to_string(), version))
            .ok_or_else(|| FlowError::UnknownNodeTypes {
                types: vec![format!("{node_type}@{version}")],
            })?;
        factory()
    }
}

impl Workflow {
    /// Serialize the workflow to its stable export shape
    pub fn export(&self) -> WorkflowExport {
        let nodes = self
            .nodes()
            .map(|(_, node)| NodeExport {
                properties: node.properties().clone(),
                config: node.config(),
                inputs: node.input_ports().to_vec(),
                outputs: node.output_ports().to_vec(),
                annotation: node.annotation().map(str::to_string),
            })
            .collect();

        let mut links_by_source: BTreeMap<String, BTreeMap<String, Vec<LinkEndpoint>>> =
            BTreeMap::new();
        for link in self.links() {
            links_by_source
                .entry(link.source_node.clone())
                .or_default()
                .entry(link.target_input.clone())
                .or_default()
                .push(LinkEndpoint {
                    target_node: link.target_node.clone(),
                    output_port_name: link.source_output.clone(),
                    link_type: link.link_type,
                });
        }

        let mock_data = self.all_mock_data();

        WorkflowExport {
            version: EXPORT_VERSION,
            id: self.id().to_string(),
            name: self.name().map(str::to_string),
            nodes,
            links_by_source,
            settings: self.settings().clone(),
            static_data: self.static_data(),
            mock_data: if mock_data.is_empty() {
                None
            } else {
                Some(mock_data)
            },
        }
    }

    /// Serialize to a JSON string
    pub fn export_json(&self) -> FlowResult<String> {
        Ok(serde_json::to_string_pretty(&self.export())?)
    }

    /// Rebuild a workflow from its export.
    ///
    /// Fails on an unsupported version, on node types missing from the
    /// registry (all missing `name@version` tuples are listed), and on links
    /// whose endpoints do not exist.
    pub fn import(export: WorkflowExport, registry: &NodeTypeRegistry) -> FlowResult<Self> {
        if export.version != EXPORT_VERSION {
            return Err(FlowError::UnsupportedExportVersion {
                version: export.version,
            });
        }

        let missing: Vec<String> = export
            .nodes
            .iter()
            .filter(|n| !registry.contains(&n.properties.node_type, n.properties.version))
            .map(|n| format!("{}@{}", n.properties.node_type, n.properties.version))
            .collect();
        if !missing.is_empty() {
            return Err(FlowError::UnknownNodeTypes { types: missing });
        }

        let mut workflow = Workflow::new(export.id);
        if let Some(name) = export.name {
            workflow = workflow.with_name(name);
        }
        workflow = workflow.with_settings(export.settings);
        workflow.replace_static_data(export.static_data);
        if let Some(mock_data) = export.mock_data {
            for (node, output) in mock_data {
                workflow.set_mock_data(node, output);
            }
        }

        for stored in export.nodes {
            let mut node =
                registry.create(&stored.properties.node_type, stored.properties.version)?;
            node.apply_import(
                stored.properties,
                stored.inputs,
                stored.outputs,
                stored.annotation,
            )?;
            if !stored.config.is_empty() {
                node.setup(&serde_json::Value::Object(stored.config))?;
            }
            workflow.add_node(node)?;
        }

        for (source_node, by_input) in export.links_by_source {
            for (target_input, endpoints) in by_input {
                for endpoint in endpoints {
                    workflow.add_link(Link {
                        source_node: source_node.clone(),
                        source_output: endpoint.output_port_name,
                        target_node: endpoint.target_node,
                        target_input: target_input.clone(),
                        link_type: endpoint.link_type,
                    })?;
                }
            }
        }

        Ok(workflow)
    }

    /// Rebuild a workflow from a JSON string
    pub fn import_json(json: &str, registry: &NodeTypeRegistry) -> FlowResult<Self> {
        let export: WorkflowExport = serde_json::from_str(json)?;
        Self::import(export, registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Process, ProcessContext};
    use async_trait::async_trait;
    use serde_json::json;

    struct Fetch;

    #[async_trait]
    impl Process for Fetch {
        fn node_type(&self) -> &'static str {
            "test.fetch"
        }

        async fn process(&self, _ctx: ProcessContext) -> FlowResult<NodeOutput> {
            Ok(NodeOutput::new())
        }
    }

    struct Transform;

    #[async_trait]
    impl Process for Transform {
        fn node_type(&self) -> &'static str {
            "test.transform"
        }

        async fn process(&self, _ctx: ProcessContext) -> FlowResult<NodeOutput> {
            Ok(NodeOutput::new())
        }
    }

    fn fetch_node(name: &str) -> FlowResult<FlowNode> {
        FlowNode::builder(name)
            .output("output", "record")
            .config_schema(json!({
                "type": "object",
                "properties": {"url": {"type": "string"}},
                "required": ["url"]
            }))
            .behavior(Fetch)
            .build()
    }

    fn transform_node(name: &str) -> FlowResult<FlowNode> {
        FlowNode::builder(name)
            .input("input", "record")
            .output("output", "record")
            .behavior(Transform)
            .build()
    }

    fn registry() -> NodeTypeRegistry {
        let mut registry = NodeTypeRegistry::new();
        registry.register("test.fetch", 1, || fetch_node("placeholder"));
        registry.register("test.transform", 1, || transform_node("placeholder"));
        registry
    }

    fn sample_workflow() -> Workflow {
        let mut workflow = Workflow::new("wf-export").with_name("sample");
        let fetch = fetch_node("fetch").unwrap();
        fetch.setup(&json!({"url": "https://example.com"})).unwrap();
        workflow.add_node(fetch).unwrap();
        workflow.add_node(transform_node("shape").unwrap()).unwrap();
        workflow
            .add_link(Link::new("fetch", "output", "shape", "input"))
            .unwrap();
        workflow.set_static_value("region", json!("eu"));
        workflow
    }

    #[test]
    fn test_round_trip_preserves_observables() {
        let original = sample_workflow();
        let json = original.export_json().unwrap();
        let imported = Workflow::import_json(&json, &registry()).unwrap();

        assert_eq!(
            imported.node_names().collect::<Vec<_>>(),
            original.node_names().collect::<Vec<_>>()
        );
        assert_eq!(imported.settings(), original.settings());
        assert_eq!(imported.static_data(), original.static_data());
        assert_eq!(imported.links_from("fetch"), original.links_from("fetch"));
        assert_eq!(imported.links_to("shape"), original.links_to("shape"));

        let fetch = imported.node("fetch").unwrap();
        assert_eq!(fetch.config()["url"], json!("https://example.com"));
        assert_eq!(fetch.output_ports(), original.node("fetch").unwrap().output_ports());
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut export = sample_workflow().export();
        export.version = 2;
        assert!(matches!(
            Workflow::import(export, &registry()),
            Err(FlowError::UnsupportedExportVersion { version: 2 })
        ));
    }

    #[test]
    fn test_missing_node_types_are_listed() {
        let export = sample_workflow().export();
        let empty = NodeTypeRegistry::new();
        match Workflow::import(export, &empty) {
            Err(FlowError::UnknownNodeTypes { types }) => {
                assert!(types.contains(&"test.fetch@1".to_string()));
                assert!(types.contains(&"test.transform@1".to_string()));
            }
            other => panic!("expected unknown node types, got {other:?}"),
        }
    }

    #[test]
    fn test_import_validates_link_endpoints() {
        let mut export = sample_workflow().export();
        export
            .links_by_source
            .entry("fetch".to_string())
            .or_default()
            .entry("input".to_string())
            .or_default()
            .push(LinkEndpoint {
                target_node: "ghost".to_string(),
                output_port_name: "output".to_string(),
                link_type: LinkType::Standard,
            });

        assert!(matches!(
            Workflow::import(export, &registry()),
            Err(FlowError::Structure(_))
        ));
    }

    #[test]
    fn test_import_revalidates_config() {
        let mut export = sample_workflow().export();
        for node in &mut export.nodes {
            if node.properties.node_type == "test.fetch" {
                node.config.insert("url".to_string(), json!(42));
            }
        }

        assert!(matches!(
            Workflow::import(export, &registry()),
            Err(FlowError::Configuration { .. })
        ));
    }
}
