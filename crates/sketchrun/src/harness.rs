//! Program skeleton that emulates the microcontroller runtime
//!
//! The harness provides a `Serial` object and a `main` that calls the
//! sketch's `setup()` once and `loop()` a bounded number of times. Student
//! code is placed after `main`, behind a `#line` directive, so compiler
//! diagnostics point at the student's own lines in `sketch.ino`.

use crate::config::HarnessConfig;

/// Insertion point for the student's sketch
pub const SKETCH_PLACEHOLDER: &str = "{{SKETCH}}";

/// File name the compiler reports in diagnostics for student code
pub const SKETCH_FILE_NAME: &str = "sketch.ino";

const LOOP_ITERATIONS_PLACEHOLDER: &str = "{{LOOP_ITERATIONS}}";
const EOL_PLACEHOLDER: &str = "{{EOL}}";
const SKETCH_FILE_PLACEHOLDER: &str = "{{SKETCH_FILE}}";

const TEMPLATE: &str = r#"#include <iostream>
#include <string>

using String = std::string;

class SerialPort {
public:
    void begin(long) {}
    void end() {}
    explicit operator bool() const { return true; }

    template <typename T>
    void print(const T& value) { std::cout << value; }

    template <typename T>
    void println(const T& value) { std::cout << value << {{EOL}}; }

    void println() { std::cout << {{EOL}}; }
};

SerialPort Serial;

void setup();
void loop();

int main() {
    setup();
    for (long iteration = 0; iteration < {{LOOP_ITERATIONS}}; ++iteration) {
        loop();
    }
    std::cout.flush();
    return 0;
}

#line 1 "{{SKETCH_FILE}}"
{{SKETCH}}
"#;

/// Rendered harness, split around the sketch insertion point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Harness {
    prologue: String,
    epilogue: String,
}

impl Harness {
    /// Render the harness for the given settings
    pub fn new(config: &HarnessConfig) -> Self {
        let eol = if config.println_newline { r#""\n""# } else { r#""""# };
        let rendered = TEMPLATE
            .replace(EOL_PLACEHOLDER, eol)
            .replace(LOOP_ITERATIONS_PLACEHOLDER, &config.loop_iterations.to_string())
            .replace(SKETCH_FILE_PLACEHOLDER, SKETCH_FILE_NAME);

        let (prologue, epilogue) = rendered
            .split_once(SKETCH_PLACEHOLDER)
            .expect("harness template should contain the sketch placeholder");

        Self {
            prologue: prologue.to_owned(),
            epilogue: epilogue.to_owned(),
        }
    }

    /// Everything before the sketch
    pub fn prologue(&self) -> &str {
        &self.prologue
    }

    /// Everything after the sketch
    pub fn epilogue(&self) -> &str {
        &self.epilogue
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new(&HarnessConfig::default())
    }
}
