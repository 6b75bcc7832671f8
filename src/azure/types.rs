use serde::{Deserialize, Serialize};

/// `{ "count": n, "value": [...] }` envelope used by list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse<T> {
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub account_id: String,
    pub account_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub state: Option<String>,
}

impl Project {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            state: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WiqlQuery<'a> {
    pub query: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WiqlResult {
    #[serde(rename = "workItems", default)]
    pub work_items: Vec<WorkItemReference>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkItemReference {
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: u32,
    #[serde(default)]
    pub rev: i32,
    pub fields: WorkItemFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemFields {
    #[serde(rename = "System.Title", default)]
    pub title: String,
    #[serde(rename = "System.WorkItemType", default)]
    pub work_item_type: String,
    #[serde(rename = "System.State", default)]
    pub state: Option<String>,
}

impl WorkItem {
    pub fn new(id: u32, title: &str, work_item_type: &str) -> Self {
        Self {
            id,
            rev: 1,
            fields: WorkItemFields {
                title: title.to_string(),
                work_item_type: work_item_type.to_string(),
                state: None,
            },
        }
    }

    /// Text of a dropdown entry: `"{title} - {type}"`.
    pub fn option_label(&self) -> String {
        format!("{} - {}", self.fields.title, self.fields.work_item_type)
    }

    pub fn type_icon(&self) -> &'static str {
        match self.fields.work_item_type.as_str() {
            "Bug" => "⊗",
            "User Story" => "◈",
            "Task" => "☑",
            "Feature" => "★",
            "Epic" => "⚡",
            "Issue" => "⚠",
            "Test Case" => "◇",
            "Product Backlog Item" => "▣",
            _ => "•",
        }
    }
}

/// Which list a work item lookup fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkItemFilter {
    /// Everything assigned to the caller, most recently changed first.
    Assigned,
    /// Open backlog-level items assigned to the caller.
    Backlog,
}

impl WorkItemFilter {
    pub fn wiql(&self) -> &'static str {
        match self {
            WorkItemFilter::Assigned => {
                "SELECT [System.Id], [System.WorkItemType] FROM WorkItems \
                 WHERE [System.AssignedTo] = @Me ORDER BY [System.ChangedDate] DESC"
            }
            WorkItemFilter::Backlog => {
                "SELECT [System.Id], [System.WorkItemType] FROM WorkItems \
                 WHERE [System.WorkItemType] IN ('Product Backlog Item','User Story','Feature') \
                 AND [System.State] <> 'Done' AND [System.AssignedTo] = @Me \
                 ORDER BY [System.ChangedDate] DESC"
            }
        }
    }
}
