//! Extraction prompt templates.

use super::parser::{COMPLETION_MARKER, TUPLE_DELIMITER};
use crate::config::ExtractionConfig;
use crate::llm::Message;

const SYSTEM_TEMPLATE: &str = r"---Role---
You are a Knowledge Graph Specialist responsible for extracting entities and relationships from the input text.

---Instructions---
1. Entity extraction: identify clearly defined and meaningful entities in the input text. For each entity output:
   - entity_name: the name of the entity. Use title case for case-insensitive names and keep the name consistent across the whole output.
   - entity_type: one of the following types: {entity_types}. If none applies, use `Other`.
   - entity_description: a concise yet comprehensive description of the entity's attributes and activities, based only on the input text.
   Format each entity as four fields separated by `{tuple_delimiter}` on a single line, the first field being the literal word `entity`.
2. Relationship extraction: identify direct, clearly stated and meaningful relationships between previously extracted entities. For each relationship output:
   - source_entity: name of the source entity, identical to its entity_name.
   - target_entity: name of the target entity, identical to its entity_name.
   - relationship_keywords: one or more high-level keywords summarizing the relationship, separated by commas.
   - relationship_description: a concise explanation of the nature of the relationship.
   Format each relationship as five fields separated by `{tuple_delimiter}` on a single line, the first field being the literal word `relation`.
3. Treat relationships as undirected unless the text states a direction. Do not output the same relationship twice.
4. Output one record per line. Output all entities first, then all relationships.
5. Write names and descriptions in {language}. Keep proper nouns in their original language.
6. Output the literal string `{completion_delimiter}` on its own line after the last record.
{examples}";

const USER_TEMPLATE: &str = r"---Task---
Extract entities and relationships from the input text below.

---Input Text---
```
{input_text}
```

---Output---
";

const CONTINUE_TEMPLATE: &str = r"Based on the last extraction, identify any entities or relationships that were missed or incorrectly formatted in the input text.
Do not repeat records that were already extracted correctly. Use exactly the same format, and output `{completion_delimiter}` on its own line when done.

---Output---
";

const EXAMPLES: [&str; 2] = [
    r#"```
<Input Text>
While Alex clenched his jaw, the buzz of frustration dull against the backdrop of Taylor's authoritarian certainty. Jordan shared Alex's commitment to discovery, a silent rebellion against Cruz's narrowing vision of control and order.

<Output>
entity{tuple_delimiter}Alex{tuple_delimiter}person{tuple_delimiter}Alex is a character who experiences frustration and is observant of the dynamics among other characters.
entity{tuple_delimiter}Taylor{tuple_delimiter}person{tuple_delimiter}Taylor is portrayed with authoritarian certainty.
entity{tuple_delimiter}Jordan{tuple_delimiter}person{tuple_delimiter}Jordan shares a commitment to discovery.
entity{tuple_delimiter}Cruz{tuple_delimiter}person{tuple_delimiter}Cruz is associated with a vision of control and order.
relation{tuple_delimiter}Alex{tuple_delimiter}Taylor{tuple_delimiter}power dynamics, tension{tuple_delimiter}Alex observes Taylor's authoritarian behavior.
relation{tuple_delimiter}Alex{tuple_delimiter}Jordan{tuple_delimiter}shared goals, rebellion{tuple_delimiter}Alex and Jordan share a commitment to discovery.
relation{tuple_delimiter}Jordan{tuple_delimiter}Cruz{tuple_delimiter}ideological conflict{tuple_delimiter}Jordan's commitment to discovery rebels against Cruz's vision of control.
{completion_delimiter}
```"#,
    r#"```
<Input Text>
Stock markets faced a sharp downturn today as tech giants saw significant declines, with the Global Tech Index dropping by 3.4% in midday trading. Nexon Technologies saw its stock plummet by 7.8% after reporting lower-than-expected quarterly earnings.

<Output>
entity{tuple_delimiter}Global Tech Index{tuple_delimiter}category{tuple_delimiter}The Global Tech Index tracks major technology stocks and dropped 3.4% today.
entity{tuple_delimiter}Nexon Technologies{tuple_delimiter}organization{tuple_delimiter}Nexon Technologies is a tech company whose stock fell 7.8% after disappointing earnings.
entity{tuple_delimiter}Market Selloff{tuple_delimiter}event{tuple_delimiter}A sharp market downturn driven by declines among tech giants.
relation{tuple_delimiter}Global Tech Index{tuple_delimiter}Market Selloff{tuple_delimiter}market decline{tuple_delimiter}The index's drop is part of the broader selloff.
relation{tuple_delimiter}Nexon Technologies{tuple_delimiter}Global Tech Index{tuple_delimiter}company impact, index movement{tuple_delimiter}Nexon's decline contributed to the index drop.
{completion_delimiter}
```"#,
];

/// Builds the message sequence for one chunk.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    config: ExtractionConfig,
}

impl PromptBuilder {
    pub fn new(config: ExtractionConfig) -> Self {
        Self { config }
    }

    pub fn system(&self) -> String {
        let examples = if self.config.use_examples {
            let rendered: Vec<String> = EXAMPLES.iter().map(|e| fill(e)).collect();
            format!("\n---Examples---\n{}\n", rendered.join("\n\n"))
        } else {
            String::new()
        };
        fill(SYSTEM_TEMPLATE)
            .replace("{entity_types}", &self.config.entity_types.join(", "))
            .replace("{language}", &self.config.language)
            .replace("{examples}", &examples)
    }

    pub fn user(&self, chunk_text: &str) -> String {
        USER_TEMPLATE.replace("{input_text}", chunk_text)
    }

    pub fn continuation(&self) -> String {
        fill(CONTINUE_TEMPLATE)
    }

    /// System and user turns for the first extraction pass.
    pub fn initial_messages(&self, chunk_text: &str) -> Vec<Message> {
        vec![Message::system(self.system()), Message::user(self.user(chunk_text))]
    }
}

fn fill(template: &str) -> String {
    template
        .replace("{tuple_delimiter}", TUPLE_DELIMITER)
        .replace("{completion_delimiter}", COMPLETION_MARKER)
}
