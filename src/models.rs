use serde::{Deserialize, Serialize};

/// Canonical site record as kept by the administrative side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    pub id: i64,
    pub canonical_name: String,
    pub canonical_code: Option<String>,
    /// Source-specific identifiers, keyed by the source's alias key.
    pub aliases: serde_json::Value,
}

impl Site {
    pub fn reference(&self) -> SiteRef {
        SiteRef {
            id: self.id,
            name: self.canonical_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QuestionRequest {
    pub user_question: String,
    #[serde(default)]
    pub center_id: Option<i64>,
    #[serde(default)]
    pub contexto_previo: Vec<serde_json::Map<String, serde_json::Value>>,
    /// Chart intent decided upstream; the keyword classifier is used when absent.
    #[serde(default)]
    pub wants_chart: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChartSeries {
    pub name: String,
    pub data: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChartData {
    #[serde(rename = "type")]
    pub chart_type: String,
    pub title: String,
    #[serde(rename = "xAxis")]
    pub x_axis: Vec<String>,
    pub series: Vec<ChartSeries>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalAnswer {
    pub answer: String,
    pub chart: Option<ChartData>,
    pub debug_context: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataRange {
    pub has_data: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub center_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_record: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_record: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::{ChartData, ChartSeries};

    #[test]
    fn chart_uses_frontend_field_names() {
        let chart = ChartData {
            chart_type: "line".to_string(),
            title: "t".to_string(),
            x_axis: vec!["2024-01-01 00:00:00".to_string()],
            series: vec![ChartSeries {
                name: "Temperature".to_string(),
                data: vec![None],
            }],
        };
        let value = serde_json::to_value(&chart).expect("serialize chart");
        assert_eq!(value["type"], "line");
        assert_eq!(value["xAxis"][0], "2024-01-01 00:00:00");
        assert!(value["series"][0]["data"][0].is_null());
    }
}
