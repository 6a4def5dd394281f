/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use hyper::StatusCode;

error_chain! {
    links {
        FxaAuth(::fxa_auth::Error, ::fxa_auth::ErrorKind);
    }
    foreign_links {
        Base64Decode(::base64::DecodeError);
        BadCleartextUtf8(::std::string::FromUtf8Error);
        BadUrl(::reqwest::UrlError);
        HexError(::hex::FromHexError);
        JsonError(::serde_json::Error);
        OpensslError(::openssl::error::ErrorStack);
        RequestError(::reqwest::Error);
    }
    errors {
        BadKeyLength(which_key: &'static str, length: usize) {
            description("Incorrect key length")
            display("Incorrect key length for key {}: {}", which_key, length)
        }

        // Not including `expected` and `is`, since they don't seem useful and are inconvenient
        // to include. If we decide we want them it's not too bad to include.
        HmacMismatch {
            description("SHA256 HMAC mismatch error")
            display("SHA256 HMAC mismatch error")
        }

        StorageHttpError(code: ::hyper::StatusCode, route: String) {
            description("HTTP error status when making a request to storage server")
            display("HTTP status {} during a storage request to \"{}\"", code, route)
        }

        TokenserverHttpError(code: ::hyper::StatusCode) {
            description("HTTP status when requesting a token from the tokenserver")
            display("HTTP status {} when requesting a token from the tokenserver", code)
        }

        // meta/global carries a storage version we do not speak. The only
        // way out is a fresh account.
        StorageVersionMismatch(version: i64) {
            description("Unsupported storage version")
            display("Unsupported storage version {}", version)
        }

        NotSignedIn {
            description("No account is signed in")
            display("No account is signed in")
        }

        MissingCryptoKeys {
            description("The crypto/keys secret is not available")
            display("The crypto/keys secret is not available")
        }

        UnexpectedError(message: String) {
            description("Unexpected error")
            display("Unexpected error: {}", message)
        }
    }
}

// Boilerplate helper...
pub fn unexpected<S>(s: S) -> Error
where
    S: Into<String>,
{
    ErrorKind::UnexpectedError(s.into()).into()
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        match *self.kind() {
            ErrorKind::StorageHttpError(code, _) => code == StatusCode::NotFound,
            _ => false,
        }
    }

    /// Errno 110 from the FxA server: the session token was invalidated by a
    /// password change.
    pub fn is_auth_invalidated(&self) -> bool {
        match *self.kind() {
            ErrorKind::FxaAuth(ref kind) => match *kind {
                ::fxa_auth::ErrorKind::RemoteError(_, errno, ..) => errno == 110,
                _ => false,
            },
            _ => false,
        }
    }

    /// The signed certificate did not belong to the signed-in account.
    pub fn is_certificate_invalid(&self) -> bool {
        match *self.kind() {
            ErrorKind::FxaAuth(ref kind) => match *kind {
                ::fxa_auth::ErrorKind::CertificateInvalid => true,
                _ => false,
            },
            _ => false,
        }
    }
}
