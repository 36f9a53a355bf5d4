use std::io;

use httparse;


quick_error! {
    /// Errors of the protocol and runtime surface
    #[derive(Debug)]
    pub enum Error {
        Io(err: io::Error) {
            description("I/O error")
            display("I/O error: {}", err)
            from()
        }
        BadRequestLine {
            description("malformed request line")
        }
        BadRequestTarget {
            description("error parsing request target")
        }
        PathTraversal {
            description("request path contains `.` or `..` segments")
        }
        BadHeader {
            description("malformed header line")
        }
        ContentLengthInvalid {
            description("invalid content-length header")
        }
        UnsupportedTransferEncoding(enc: String) {
            description("unrecognised transfer encoding")
            display("unrecognised transfer encoding: {:?}", enc)
        }
        ChunkParseError(err: httparse::InvalidChunkSize) {
            description("chunk size parse error")
            from()
        }
        StageStopped(name: String) {
            description("event queued on a stopped stage")
            display("event queued on stopped stage {:?}", name)
        }
    }
}
