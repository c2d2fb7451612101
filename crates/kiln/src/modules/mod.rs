use crate::config::ConfigDoc;
use crate::error::Result;
use crate::planner::Plan;

pub mod recipe;
pub mod util;

pub trait Module {
    fn id(&self) -> &'static str;
    /// Whether this module handles the given recipe document.
    fn detect(&self, doc: &ConfigDoc) -> bool;
    fn plan(&self, plan: &mut Plan) -> Result<()>;
}

pub fn builtin_modules() -> Vec<Box<dyn Module>> {
    vec![Box::new(recipe::RecipeModule)]
}
