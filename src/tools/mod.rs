//! 工具层：一等 Schema、执行垫片（注册表）与各 Agent 的工具

pub mod nutrition;
pub mod planning;
pub mod recipe;
pub mod registry;
pub mod schema;
pub mod shopping;

pub use nutrition::{DietaryProfileTool, RecipeNutritionTool};
pub use planning::{LeftoversTool, MealHistoryTool, RecentRecipesTool};
pub use recipe::{
    extract_json_ld_recipe, EstimateNutritionTool, ExtractStructuredRecipeTool, FetchPageTool,
    HttpPageFetcher, PageFetcher, SearchRecipesTool,
};
pub use registry::{AgentTool, ToolRegistry, ToolResult};
pub use schema::{classification_schema_json, ParamType, ToolFormat, ToolParameter, ToolSchema};
pub use shopping::PlanIngredientsTool;
