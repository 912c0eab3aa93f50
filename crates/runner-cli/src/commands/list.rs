//! `pipeline-runner list`: enumerate pipelines in the pipeline file.

use std::path::Path;

use runner_config::PIPELINE_FILE;

pub fn list(project_dir: &Path) -> i32 {
    let path = project_dir.join(PIPELINE_FILE);
    let set = match runner_config::parse_file(&path) {
        Ok(set) => set,
        Err(e) => {
            eprintln!("error: {e}");
            return 2;
        }
    };

    for (selector, pipeline) in &set.pipelines {
        let steps: usize = pipeline.groups.iter().map(|g| g.steps.len()).sum();
        let variables = if pipeline.variables.is_empty() {
            String::new()
        } else {
            format!(
                " (variables: {})",
                pipeline
                    .variables
                    .iter()
                    .map(|v| v.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        println!("{selector}: {steps} step(s){variables}");
    }
    0
}
