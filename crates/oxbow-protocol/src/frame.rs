use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn default_run_name() -> String {
    "__main__".to_string()
}

/// One message on the worker channel, tagged by its `action` field.
///
/// The first three variants travel host → worker, the rest worker → host.
/// Field names are part of the wire contract and must not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Frame {
    /// Import the module at `modulePath` and call `function` with the given
    /// positional and keyword arguments.
    #[serde(rename = "execute")]
    Execute {
        #[serde(rename = "modulePath")]
        module_path: String,
        function: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
    },

    /// Run the script at `scriptPath` as if invoked from the command line
    /// with `args` as its argv tail.
    #[serde(rename = "run")]
    Run {
        #[serde(rename = "scriptPath")]
        script_path: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default = "default_run_name")]
        run_name: String,
    },

    /// Ask the worker to shut down. The worker answers with [`Frame::Exited`]
    /// before closing its end of the channel.
    #[serde(rename = "exit")]
    Exit,

    /// Terminal reply for a successful `execute` or `run`.
    #[serde(rename = "execution finished")]
    ExecutionFinished {
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Terminal reply for a failed `execute` or `run`.
    #[serde(rename = "error")]
    Error {
        exception: String,
        #[serde(default)]
        traceback: Vec<String>,
    },

    /// Acknowledgement of [`Frame::Exit`].
    #[serde(rename = "exited")]
    Exited,
}

impl Frame {
    /// True for the two frames that terminate a request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::ExecutionFinished { .. } | Frame::Error { .. })
    }
}
