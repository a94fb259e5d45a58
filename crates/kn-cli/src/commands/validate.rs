use std::path::Path;

use anyhow::Context;
use kn_agents::planner::{Plan, Planner, StaticPlanner};
use kn_core::dag::TaskDag;

use super::load_spec;

pub async fn run(spec_path: &Path, plan_path: Option<&Path>) -> anyhow::Result<()> {
    let spec = load_spec(spec_path)?;
    let planner = match plan_path {
        Some(path) => StaticPlanner::from_file(path),
        None => StaticPlanner::from_spec(),
    };
    let plan = planner.plan(&spec).await.context("loading plan")?;
    let order = execution_order(&plan)?;

    println!(
        "Plan OK: {} task(s), {} agent(s)",
        plan.tasks.len(),
        plan.agents.len()
    );
    for (i, id) in order.iter().enumerate() {
        let task = plan.tasks.iter().find(|t| &t.id == id);
        let name = task.map(|t| t.name.as_str()).unwrap_or_default();
        let agent = task.map(|t| t.agent_name.as_str()).unwrap_or_default();
        println!("{:>3}. {id}  {name}  ({agent})", i + 1);
    }
    Ok(())
}

pub fn execution_order(plan: &Plan) -> anyhow::Result<Vec<String>> {
    let mut dag = TaskDag::new();
    for task in &plan.tasks {
        dag.add(task.id.clone(), task.dependencies.iter().cloned())?;
    }
    Ok(dag.order()?)
}
