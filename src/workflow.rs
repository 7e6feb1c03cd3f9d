use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml_ng::Value;

// --- Raw concurrency ---

/// Concurrency as authored: a group expression and a cancel-in-progress expression.
///
/// Accepts both the short form (`concurrency: deploy`) and the mapping form
/// (`concurrency: { group: deploy, cancel-in-progress: true }`).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(from = "RawConcurrencyRepr")]
pub struct RawConcurrency {
    pub group: String,
    #[serde(rename = "cancel-in-progress", skip_serializing_if = "String::is_empty")]
    pub cancel_in_progress: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawConcurrencyRepr {
    Group(String),
    Full {
        #[serde(default)]
        group: String,
        #[serde(rename = "cancel-in-progress", default)]
        cancel_in_progress: Option<Scalar>,
    },
}

impl From<RawConcurrencyRepr> for RawConcurrency {
    fn from(repr: RawConcurrencyRepr) -> Self {
        match repr {
            RawConcurrencyRepr::Group(group) => RawConcurrency {
                group,
                cancel_in_progress: String::new(),
            },
            RawConcurrencyRepr::Full {
                group,
                cancel_in_progress,
            } => RawConcurrency {
                group,
                cancel_in_progress: cancel_in_progress.map(Scalar::into_string).unwrap_or_default(),
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(i) => i.to_string(),
            Scalar::Str(s) => s,
        }
    }
}

fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Scalar>::deserialize(deserializer)?
        .map(Scalar::into_string)
        .unwrap_or_default())
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    })
}

// --- Job definitions ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Strategy {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub matrix: BTreeMap<String, Vec<Value>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One job of a workflow file. Keys this crate does not interpret are kept in `extra`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct JobDefinition {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(
        default,
        deserialize_with = "string_or_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub needs: Vec<String>,
    #[serde(
        rename = "runs-on",
        default,
        deserialize_with = "string_or_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub runs_on: Vec<String>,
    #[serde(
        rename = "if",
        default,
        deserialize_with = "scalar_string",
        skip_serializing_if = "String::is_empty"
    )]
    pub if_condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<RawConcurrency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl JobDefinition {
    /// Drop the `needs` list; needs are tracked on the job row instead.
    pub fn erase_needs(mut self) -> Self {
        self.needs.clear();
        self
    }

    pub fn has_if_condition(&self) -> bool {
        !self.if_condition.trim().is_empty()
    }
}

/// A workflow reduced to exactly one job, the unit stored on each job row.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct SingleWorkflow {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "on", default, skip_serializing_if = "Option::is_none")]
    pub on: Option<Value>,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobDefinition>,
}

impl SingleWorkflow {
    pub fn new(name: &str, job_id: &str, job: JobDefinition) -> Self {
        let mut wf = SingleWorkflow {
            name: name.to_string(),
            ..Default::default()
        };
        wf.set_job(job_id, job);
        wf
    }

    /// The workflow's job and its id. A single workflow holds exactly one.
    pub fn job(&self) -> Option<(&str, &JobDefinition)> {
        self.jobs.iter().next().map(|(id, job)| (id.as_str(), job))
    }

    pub fn set_job(&mut self, id: &str, job: JobDefinition) {
        self.jobs.clear();
        self.jobs.insert(id.to_string(), job);
    }

    pub fn marshal(&self) -> Result<String, String> {
        serde_yaml_ng::to_string(self).map_err(|e| format!("Failed to serialize workflow: {}", e))
    }

    pub fn parse(payload: &str) -> Result<Self, String> {
        let wf: SingleWorkflow = serde_yaml_ng::from_str(payload)
            .map_err(|e| format!("Failed to parse workflow payload: {}", e))?;
        if wf.jobs.len() != 1 {
            return Err(format!(
                "Workflow payload must hold exactly one job, found {}",
                wf.jobs.len()
            ));
        }
        Ok(wf)
    }
}

/// Reports whether a stored payload carries a non-empty `if` expression.
///
/// Unreadable payloads report `false`.
pub fn has_if_condition(payload: &str) -> bool {
    SingleWorkflow::parse(payload)
        .ok()
        .and_then(|wf| wf.job().map(|(_, job)| job.has_if_condition()))
        .unwrap_or(false)
}

/// Split a workflow file into single-job workflows, expanding matrices.
///
/// Every matrix combination becomes its own job sharing the symbolic id, so
/// a job that needs it fans in over all of them.
pub fn parse_workflow(content: &str) -> Result<Vec<SingleWorkflow>, String> {
    let wf: SingleWorkflow = serde_yaml_ng::from_str(content)
        .map_err(|e| format!("Failed to parse workflow: {}", e))?;
    if wf.jobs.is_empty() {
        return Err("Workflow has no jobs".to_string());
    }

    let mut singles = Vec::new();
    for (id, job) in &wf.jobs {
        for expanded in expand_matrix(id, job) {
            singles.push(SingleWorkflow {
                name: wf.name.clone(),
                on: wf.on.clone(),
                jobs: BTreeMap::from([(id.clone(), expanded)]),
            });
        }
    }
    Ok(singles)
}

fn expand_matrix(id: &str, job: &JobDefinition) -> Vec<JobDefinition> {
    let matrix = match &job.strategy {
        Some(strategy) if !strategy.matrix.is_empty() => &strategy.matrix,
        _ => return vec![job.clone()],
    };

    let mut combos: Vec<Vec<(String, Value)>> = vec![Vec::new()];
    for (key, values) in matrix {
        combos = combos
            .into_iter()
            .flat_map(|combo| {
                values.iter().map(move |v| {
                    let mut next = combo.clone();
                    next.push((key.clone(), v.clone()));
                    next
                })
            })
            .collect();
    }

    let base_name = if job.name.is_empty() { id } else { &job.name };
    combos
        .into_iter()
        .map(|combo| {
            let label: Vec<String> = combo.iter().map(|(_, v)| value_label(v)).collect();
            let mut expanded = job.clone();
            expanded.name = format!("{} ({})", base_name, label.join(", "));
            if let Some(strategy) = expanded.strategy.as_mut() {
                strategy.matrix = combo.into_iter().map(|(k, v)| (k, vec![v])).collect();
            }
            expanded
        })
        .collect()
}

fn value_label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_yaml_ng::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}
