//! Fixed prompt texts
//!
//! Two prompt sets exist, one per pipeline variant. The code-first set drives
//! vision → plan → code → tool execution; the tool-planned set drives a
//! single tool-integrated planning agent.

use crate::plan::RelationType;
use std::fmt::Write as _;
use std::path::Path;

const EXPERT: &str = "You are an expert in image analysis, 3D modeling, and Blender scripting.";

/// Prompts used by the stages of one variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSet {
    /// Image analysis, first pass
    pub analysis_image: String,
    /// Text-only analysis; the user input is appended
    pub analysis_text: String,
    /// Comparison against the prior description, feedback passes
    pub comparison: String,
    /// Relational planning; the vision summary is appended
    pub planning: String,
    /// Code generation; appended after the plan
    pub code: String,
    /// Code revision; appended after the plan, followed by the differences
    pub code_feedback: String,
    /// Initial tool-integrated plan instructions
    pub tool_plan: String,
    /// Tool-integrated plan revision instructions
    pub tool_plan_feedback: String,
}

impl PromptSet {
    /// Prompts for the code-first variant
    #[must_use]
    pub fn code_first() -> Self {
        Self {
            analysis_image: format!(
                "{EXPERT}\nProvide a detailed and extensive description of the image and list all \
                 assets including hdri, models and textures you will need to create it."
            ),
            analysis_text: format!(
                "{EXPERT}\nProvide a detailed and extensive description of the scene and list all \
                 assets including hdri, models and textures you will need to create it."
            ),
            comparison: format!(
                "{EXPERT}\nProvide a detailed comparison of the image and the description.\n\
                 Mark out all the differences.\n"
            ),
            planning: relational_planning_prompt(),
            code: format!(
                "{EXPERT}\nImplement the provided graph to create the described scene in Blender."
            ),
            code_feedback: format!(
                "{EXPERT}\nImplement the provided graph to create the described scene in Blender.\n\
                 Furthermore try to minimize the following differences:\n"
            ),
            tool_plan: tool_plan_prompt(),
            tool_plan_feedback: tool_plan_feedback_prompt(),
        }
    }

    /// Prompts for the tool-planned variant
    #[must_use]
    pub fn tool_planned() -> Self {
        Self {
            analysis_image: "Provide a detailed and extensive description of the image.\n\
                             Describe every object in the picture accurately.\n\
                             Describe the shape of the landscape elements."
                .to_string(),
            comparison: "How does the image compare to the description? What are the differences?"
                .to_string(),
            ..Self::code_first()
        }
    }

    /// Comparison prompt for the next feedback pass
    ///
    /// Embeds the user's request and the previous description so the model
    /// reports a structured diff against them.
    #[must_use]
    pub fn compose_comparison(&self, user_input: &str, previous_summary: &str) -> String {
        let mut prompt = self.comparison.clone();
        if !user_input.is_empty() {
            let _ = write!(prompt, "\nRequested scene:\n{user_input}");
        }
        if !previous_summary.is_empty() {
            let _ = write!(prompt, "\nPrevious description:\n{previous_summary}");
        }
        prompt
    }
}

fn relational_planning_prompt() -> String {
    let mut prompt = String::from(
        "You are tasked with constructing a relational bipartite graph for a 3D scene based on \
         the provided description and asset list.\n\
         1. Review the scene description and the list of assets.\n\
         2. Determine the spatial and contextual relationships needed to accurately represent \
         the scene's layout. Consider relationships like:\n",
    );
    for relation in RelationType::ALL {
        let _ = writeln!(prompt, "- {}: {}", capitalize(relation.name()), relation_hint(relation));
    }
    prompt.push_str(
        "Construct the relational bipartite graph 'G(s)=(A,R,E)' where:\n\
         - A represents the set of assets.\n\
         - R represents the set of relations as nodes.\n\
         - E represents the edges connecting a relation node to a subset of assets 'E(r)' in \
         the scene that satisfies this relation.\n\
         Output your findings in a structured format:\n\
         List of relation nodes 'R' with their types and descriptions.\n\
         Edges 'E' that link assets to their corresponding relation nodes.\n\
         This process will guide the arrangement of assets in the 3D scene, ensuring they are \
         positioned, scaled and oriented correctly according to the description.\n",
    );
    prompt
}

fn relation_hint(relation: RelationType) -> &'static str {
    match relation {
        RelationType::Proximity => "closeness of two objects, e.g., a chair near a table.",
        RelationType::Direction => "the angle of one object is targeting the other.",
        RelationType::Alignment => "objects align along a common axis, e.g., paintings on a wall.",
        RelationType::Symmetry => "mirroring objects along an axis, e.g., lamps beside a bed.",
        RelationType::Overlap => "one object partially covering another, e.g., a rug under a table.",
        RelationType::Parallelism => "objects parallel to each other, e.g., rows of seats.",
        RelationType::Perpendicularity => "objects at a right angle, e.g., a shelf and a desk.",
        RelationType::Hierarchy => "a list of objects following an order of size or volume.",
        RelationType::Rotation => "objects rotating around a point, e.g., chairs around a table.",
        RelationType::Repetition => "repeating patterns for rhythm, e.g., a row of street lights.",
        RelationType::Scaling => "object sizes adjusted for depth, e.g., smaller distant trees.",
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

fn tool_plan_prompt() -> String {
    "List all available tools. Create a plan to recreate the described scene in Blender, with \
     Blender code or Polyhaven assets, using the available tools.\nExecute the plan."
        .to_string()
}

fn tool_plan_feedback_prompt() -> String {
    "The new image is the result of the provided plan.\nImprove the plan to minimize the \
     differences."
        .to_string()
}

/// Instruction handed to the tool agent to run generated code
#[must_use]
pub fn execute_code_instruction(code: &str) -> String {
    format!(
        "{EXPERT}\nImport all assets you need to execute the script from Polyhaven.\n{code}\n\
         Execute the following Blender Python code:\n{code}\n\
         If it does not work try to correct the code and re-execute."
    )
}

/// Instruction handed to the tool agent to capture the render
#[must_use]
pub fn render_instruction(snippet: &str) -> String {
    format!(
        "Execute the following Blender Python code:\n{snippet}\n\
         If it does not work try to fix and re-execute it."
    )
}

/// Fixed camera setup + still render writing to `path`
#[must_use]
pub fn render_snippet(path: &Path) -> String {
    // Debug formatting yields a quoted, escaped literal Python accepts.
    let literal = format!("{:?}", path.to_string_lossy());
    format!(
        "import bpy\n\
         \n\
         cam_data = bpy.data.cameras.new(name=\"SceneCraftCamera\")\n\
         cam_object = bpy.data.objects.new(\"SceneCraftCamera\", cam_data)\n\
         cam_object.location = (0, -10, 7)\n\
         cam_object.rotation_euler = (1.1, 0, 0)\n\
         bpy.context.collection.objects.link(cam_object)\n\
         bpy.context.scene.camera = cam_object\n\
         \n\
         bpy.context.scene.render.filepath = {literal}\n\
         bpy.ops.render.render(write_still=True)\n"
    )
}
