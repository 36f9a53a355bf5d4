//! Generates a minimal default error page.

const PART1: &'static str = "\
    <!DOCTYPE html>\
    <html>\
        <head>\
            <title>\
    ";
const PART2: &'static str = "\
            </title>\
        </head>\
        <body>\
            <h1>\
    ";
const PART3: &'static str = concat!("\
            </h1>\
            <hr>\
            <p>Yours faithfully,<br>\
                seda-http/", env!("CARGO_PKG_VERSION"), "\
            </p>\
        </body>\
    </html>\
    ");

/// Render the default error body for a status code.
pub fn error_page(code: u16, reason: &str) -> Vec<u8> {
    format!("{p1}{code:03} {reason}{p2}{code:03} {reason}{p3}",
            code = code, reason = reason,
            p1 = PART1, p2 = PART2, p3 = PART3)
        .into_bytes()
}

#[cfg(test)]
mod test {
    use super::error_page;

    #[test]
    fn contains_code_and_reason() {
        let body = String::from_utf8(error_page(404, "Not Found"))
            .unwrap();
        assert!(body.contains("404 Not Found"));
        assert!(body.contains("<title>"));
    }
}
