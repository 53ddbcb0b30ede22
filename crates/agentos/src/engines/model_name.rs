/// File extension of quantized model artifacts served by local backends
const MODEL_FILE_EXTENSION: &str = ".gguf";

/// Turn a backend-reported model identifier into a short canonical name
///
/// Backends serving quantized files often report the full artifact path, e.g.
/// `/Users/x/models/TheBloke/dolphin-2.2.1-mistral-7B-GGUF/dolphin-2.2.1-mistral-7b.Q6_K.gguf`,
/// which becomes `TheBloke/dolphin-2.2.1-mistral-7B-GGUF`. Anything that is not a model file
/// is already canonical and comes back unchanged.
pub fn normalize_model_name(reported: &str) -> String {
    if !reported.ends_with(MODEL_FILE_EXTENSION) {
        return reported.to_string();
    }

    let mut name = if reported.contains('/') {
        let parts: Vec<&str> = reported.split('/').collect();
        if parts.len() > 2 {
            // owner and repository directories, without the file itself
            let file_name = parts[parts.len() - 1];
            let tail = parts[parts.len() - 3..].join("/");
            tail.strip_suffix(file_name).unwrap_or(&tail).to_string()
        } else {
            parts[parts.len() - 1].to_string()
        }
    } else {
        reported.to_string()
    };

    if let Some(stripped) = name.strip_suffix(MODEL_FILE_EXTENSION) {
        name = stripped.to_string();
    }
    if let Some(stripped) = name.strip_suffix('/') {
        name = stripped.to_string();
    }

    name
}
