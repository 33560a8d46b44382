//! Sketch source files

use serde::{Deserialize, Serialize};

/// A single sketch: a named Arduino-style source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sketch {
    pub id: String,
    /// File name, conventionally ending in `.ino`.
    pub name: String,
    /// The source code.
    pub code: String,
}

impl Sketch {
    pub fn new(id: impl Into<String>, name: impl Into<String>, code: impl Into<String>) -> Self {
        Sketch {
            id: id.into(),
            name: name.into(),
            code: code.into(),
        }
    }

    /// The classic blink sketch every new project starts from.
    pub fn blink() -> Self {
        Sketch::new(
            "1",
            "Blink.ino",
            r#"void setup() {
  pinMode(LED_BUILTIN, OUTPUT);
}

void loop() {
  digitalWrite(LED_BUILTIN, HIGH);
  delay(1000);
  digitalWrite(LED_BUILTIN, LOW);
  delay(1000);
}"#,
        )
    }
}
