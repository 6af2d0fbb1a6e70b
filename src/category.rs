//! 固定的四个项目分类。

use axum::response::Json as JsonResponse;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ApiError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    GraphicalData,
    Literature,
    QuestionnaireData,
    Other,
}

impl Category {
    pub const fn all() -> [Category; 4] {
        [
            Category::GraphicalData,
            Category::Literature,
            Category::QuestionnaireData,
            Category::Other,
        ]
    }

    pub const fn id(self) -> &'static str {
        match self {
            Category::GraphicalData => "graphical-data",
            Category::Literature => "literature",
            Category::QuestionnaireData => "questionnaire-data",
            Category::Other => "other",
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Category::GraphicalData => "Graphical Data",
            Category::Literature => "Literature",
            Category::QuestionnaireData => "Questionnaire Data",
            Category::Other => "Other",
        }
    }

    pub const fn color(self) -> &'static str {
        match self {
            Category::GraphicalData => "blue",
            Category::Literature => "purple",
            Category::QuestionnaireData => "green",
            Category::Other => "orange",
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Category::GraphicalData => "Charts, graphs, diagrams, and visual data representations",
            Category::Literature => {
                "Academic literature, journal articles, books, and other scholarly references \
                 cited in the poster."
            }
            Category::QuestionnaireData => {
                "Survey responses, questionnaire data, and research findings"
            }
            Category::Other => "Other project materials and resources",
        }
    }

    pub fn descriptor(self) -> CategoryDescriptor {
        CategoryDescriptor {
            id: self.id(),
            name: self.name(),
            color: self.color(),
            description: self.description(),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownCategory;

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Category::all()
            .into_iter()
            .find(|category| category.id() == value)
            .ok_or(UnknownCategory)
    }
}

impl From<UnknownCategory> for ApiError {
    fn from(_: UnknownCategory) -> Self {
        ApiError::NotFound("category not found".into())
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct CategoryDescriptor {
    pub id: &'static str,
    pub name: &'static str,
    pub color: &'static str,
    pub description: &'static str,
}

/// 列出全部分类。
pub async fn list_categories() -> JsonResponse<Vec<CategoryDescriptor>> {
    JsonResponse(Category::all().into_iter().map(Category::descriptor).collect())
}
