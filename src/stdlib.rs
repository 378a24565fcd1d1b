//! Known standard-library package names.
//!
//! The table covers public packages, `internal/` packages linked into every
//! binary, and the runtime pseudo-packages that show up in symbol names.

/// Sorted table of standard-library package names as they appear in symbol
/// strings. Lookup is by binary search.
static STD_PKGS: &[&str] = &[
    "archive/tar",
    "archive/zip",
    "arena",
    "bufio",
    "bytes",
    "cmp",
    "compress/bzip2",
    "compress/flate",
    "compress/gzip",
    "compress/lzw",
    "compress/zlib",
    "container/heap",
    "container/list",
    "container/ring",
    "context",
    "crypto",
    "crypto/aes",
    "crypto/cipher",
    "crypto/des",
    "crypto/dsa",
    "crypto/ecdh",
    "crypto/ecdsa",
    "crypto/ed25519",
    "crypto/elliptic",
    "crypto/hmac",
    "crypto/internal/bigmod",
    "crypto/internal/boring",
    "crypto/internal/edwards25519",
    "crypto/internal/nistec",
    "crypto/internal/randutil",
    "crypto/md5",
    "crypto/rand",
    "crypto/rc4",
    "crypto/rsa",
    "crypto/sha1",
    "crypto/sha256",
    "crypto/sha512",
    "crypto/subtle",
    "crypto/tls",
    "crypto/x509",
    "crypto/x509/pkix",
    "database/sql",
    "database/sql/driver",
    "debug/buildinfo",
    "debug/dwarf",
    "debug/elf",
    "debug/gosym",
    "debug/macho",
    "debug/pe",
    "debug/plan9obj",
    "embed",
    "encoding",
    "encoding/ascii85",
    "encoding/asn1",
    "encoding/base32",
    "encoding/base64",
    "encoding/binary",
    "encoding/csv",
    "encoding/gob",
    "encoding/hex",
    "encoding/json",
    "encoding/pem",
    "encoding/xml",
    "errors",
    "expvar",
    "flag",
    "fmt",
    "go/ast",
    "go/build",
    "go/build/constraint",
    "go/constant",
    "go/doc",
    "go/format",
    "go/importer",
    "go/parser",
    "go/printer",
    "go/scanner",
    "go/token",
    "go/types",
    "hash",
    "hash/adler32",
    "hash/crc32",
    "hash/crc64",
    "hash/fnv",
    "hash/maphash",
    "html",
    "html/template",
    "image",
    "image/color",
    "image/color/palette",
    "image/draw",
    "image/gif",
    "image/jpeg",
    "image/png",
    "index/suffixarray",
    "internal/abi",
    "internal/bisect",
    "internal/buildcfg",
    "internal/bytealg",
    "internal/chacha8rand",
    "internal/coverage",
    "internal/cpu",
    "internal/fmtsort",
    "internal/goarch",
    "internal/godebug",
    "internal/godebugs",
    "internal/goexperiment",
    "internal/goos",
    "internal/goroot",
    "internal/goversion",
    "internal/intern",
    "internal/itoa",
    "internal/lazyregexp",
    "internal/nettrace",
    "internal/oserror",
    "internal/poll",
    "internal/profile",
    "internal/race",
    "internal/reflectlite",
    "internal/safefilepath",
    "internal/singleflight",
    "internal/syscall/execenv",
    "internal/syscall/unix",
    "internal/syscall/windows",
    "internal/syscall/windows/registry",
    "internal/sysinfo",
    "internal/testlog",
    "internal/unsafeheader",
    "internal/zstd",
    "io",
    "io/fs",
    "io/ioutil",
    "iter",
    "log",
    "log/slog",
    "log/syslog",
    "maps",
    "math",
    "math/big",
    "math/bits",
    "math/cmplx",
    "math/rand",
    "math/rand/v2",
    "mime",
    "mime/multipart",
    "mime/quotedprintable",
    "net",
    "net/http",
    "net/http/cgi",
    "net/http/cookiejar",
    "net/http/fcgi",
    "net/http/httptest",
    "net/http/httptrace",
    "net/http/httputil",
    "net/http/internal",
    "net/http/pprof",
    "net/internal/socktest",
    "net/mail",
    "net/netip",
    "net/rpc",
    "net/rpc/jsonrpc",
    "net/smtp",
    "net/textproto",
    "net/url",
    "os",
    "os/exec",
    "os/signal",
    "os/user",
    "path",
    "path/filepath",
    "plugin",
    "reflect",
    "regexp",
    "regexp/syntax",
    "runtime",
    "runtime/cgo",
    "runtime/coverage",
    "runtime/debug",
    "runtime/internal/atomic",
    "runtime/internal/math",
    "runtime/internal/sys",
    "runtime/metrics",
    "runtime/pprof",
    "runtime/race",
    "runtime/trace",
    "slices",
    "sort",
    "strconv",
    "strings",
    "structs",
    "sync",
    "sync/atomic",
    "syscall",
    "testing",
    "testing/fstest",
    "testing/iotest",
    "testing/quick",
    "testing/slogtest",
    "text/scanner",
    "text/tabwriter",
    "text/template",
    "text/template/parse",
    "time",
    "time/tzdata",
    "unicode",
    "unicode/utf16",
    "unicode/utf8",
    "unique",
    "unsafe",
    "vendor/golang.org/x/crypto/chacha20",
    "vendor/golang.org/x/crypto/chacha20poly1305",
    "vendor/golang.org/x/crypto/cryptobyte",
    "vendor/golang.org/x/crypto/hkdf",
    "vendor/golang.org/x/crypto/internal/alias",
    "vendor/golang.org/x/net/dns/dnsmessage",
    "vendor/golang.org/x/net/http/httpguts",
    "vendor/golang.org/x/net/http/httpproxy",
    "vendor/golang.org/x/net/http2/hpack",
    "vendor/golang.org/x/net/idna",
    "vendor/golang.org/x/sys/cpu",
    "vendor/golang.org/x/text/secure/bidirule",
    "vendor/golang.org/x/text/transform",
    "vendor/golang.org/x/text/unicode/bidi",
    "vendor/golang.org/x/text/unicode/norm",
];

/// Returns true if the package name belongs to the standard library.
///
/// Symbol-derived names can carry trailing method context such as
/// `regexp.(*onePassInst)`, so a failed direct lookup retries with the text
/// before the first dot.
pub fn is_standard_library(pkg: &str) -> bool {
    if STD_PKGS.binary_search(&pkg).is_ok() {
        return true;
    }

    let prefix = pkg.split('.').next().unwrap_or("");
    if prefix.len() < pkg.len() && !prefix.is_empty() {
        return is_standard_library(prefix);
    }

    false
}
