/// Replaces `${VAR}` occurrences in `input` with the corresponding environment variable,
/// leaving the token untouched if the variable is unset.
pub fn substitute_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            out.push_str(rest);
            return out;
        };
        let end = start + end;
        out.push_str(&rest[..start]);
        let var_name = &rest[start + 2..end];
        match std::env::var(var_name) {
            Ok(value) => out.push_str(&value),
            Err(_) => {
                out.push_str("${");
                out.push_str(var_name);
                out.push('}');
            }
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    out
}
